//! Error types for the proxy runtime.
//!
//! This module defines the crate error enum and the wire-level
//! [`WiseException`] that every failure is surfaced through.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wise_rpc::{Communicator, Result};
//!
//! async fn example(communicator: &Communicator) -> Result<()> {
//!     let calc = communicator.string_to_proxy("calc -w calc").await?;
//!     let sum = calc.invoke("add", vec![2.into(), 3.into()]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::EndpointParse`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ConnectionLost`] |
//! | Protocol | [`Error::Protocol`], [`Error::InvalidArgument`] |
//! | Dispatch | [`Error::ObjectNotExist`], [`Error::OperationNotExist`], [`Error::UnknownLocal`] |
//! | Registration | [`Error::AlreadyUsedEndpoint`], [`Error::AlreadyRegistered`] |
//! | Promise | [`Error::AlreadyResolved`], [`Error::TypeError`] |
//! | Remote | [`Error::Remote`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! # Wire Names
//!
//! Every variant has a wire name (see [`Error::exception_name`]). Errors
//! crossing the socket travel as `[name, message]` and are mapped back to
//! the matching variant on the receiving side.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Wire Names
// ============================================================================

/// Malformed or unrecognized wire message.
pub const PROTOCOL_EXCEPTION: &str = "ProtocolException";

/// No servant registered under the requested identity.
pub const OBJECT_NOT_EXIST_EXCEPTION: &str = "ObjectNotExistException";

/// Servant has no method with the requested name.
pub const OPERATION_NOT_EXIST_EXCEPTION: &str = "OperationNotExistException";

/// Endpoint name already provisioned.
pub const ALREADY_USED_ENDPOINT: &str = "AlreadyUsedEndpoint";

/// Any other failure raised inside servant code.
pub const UNKNOWN_LOCAL_EXCEPTION: &str = "UnknownLocalException";

/// Malformed endpoint descriptor or proxy string.
pub const ENDPOINT_PARSE_EXCEPTION: &str = "EndpointParseException";

/// Identity or adapter name registered twice.
pub const ALREADY_REGISTERED_EXCEPTION: &str = "AlreadyRegisteredException";

/// Promise settled twice.
pub const ALREADY_RESOLVED_EXCEPTION: &str = "AlreadyResolvedException";

/// Promise resolved with itself.
pub const TYPE_ERROR: &str = "TypeError";

/// Socket closed while a call was in flight.
pub const CONNECTION_CLOSED_EXCEPTION: &str = "ConnectionClosedException";

/// Reconnection budget exhausted.
pub const CONNECTION_LOST_EXCEPTION: &str = "ConnectionLostException";

// ============================================================================
// WiseException
// ============================================================================

/// Uniform error carrier for protocol and application failures.
///
/// This is what travels over the wire (as `[name, message]`) and what
/// promises reject with. Convert into [`enum@Error`] with `Error::from`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct WiseException {
    /// Exception name, e.g. `ObjectNotExistException`.
    pub name: String,
    /// Human readable description.
    pub message: String,
}

impl WiseException {
    /// Creates an exception from a name and message.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns the `[name, message]` pair used on the wire.
    #[inline]
    #[must_use]
    pub fn into_pair(self) -> (String, String) {
        (self.name, self.message)
    }
}

impl From<(String, String)> for WiseException {
    fn from((name, message): (String, String)) -> Self {
        Self { name, message }
    }
}

impl From<Error> for WiseException {
    fn from(err: Error) -> Self {
        err.to_exception()
    }
}

impl From<&Error> for WiseException {
    fn from(err: &Error) -> Self {
        err.to_exception()
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when communicator configuration is invalid or incomplete.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Endpoint descriptor or proxy string could not be parsed.
    #[error("Invalid endpoint: {message}")]
    EndpointParse {
        /// Description of the parse failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Socket closed while the call was in flight.
    #[error("Connection closed: {ws_name}")]
    ConnectionClosed {
        /// Endpoint name of the closed socket.
        ws_name: String,
    },

    /// Reconnection budget exhausted; the transceiver is terminal.
    #[error("Connection lost: {message}")]
    ConnectionLost {
        /// Description including the endpoint name.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Invalid positional argument passed to a servant method.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No servant registered under the identity.
    #[error("Object does not exist: {message}")]
    ObjectNotExist {
        /// Description including the identity.
        message: String,
    },

    /// The servant has no such method.
    #[error("Operation does not exist: {message}")]
    OperationNotExist {
        /// Description including identity and method.
        message: String,
    },

    /// Unexpected failure inside servant code.
    #[error("Unknown local exception: {message}")]
    UnknownLocal {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Registration Errors
    // ========================================================================
    /// Endpoint name already provisioned or cached.
    #[error("Endpoint already used: {message}")]
    AlreadyUsedEndpoint {
        /// Description including the endpoint name.
        message: String,
    },

    /// Identity or adapter name already registered.
    #[error("Already registered: {message}")]
    AlreadyRegistered {
        /// Description of the duplicate registration.
        message: String,
    },

    // ========================================================================
    // Promise Errors
    // ========================================================================
    /// A promise was resolved or rejected a second time.
    #[error("Promise already resolved")]
    AlreadyResolved,

    /// A promise was resolved with itself.
    #[error("Type error: {message}")]
    TypeError {
        /// Description of the type error.
        message: String,
    },

    // ========================================================================
    // Remote Errors
    // ========================================================================
    /// Exception raised by the remote peer with an application-defined name.
    #[error("{name}: {message}")]
    Remote {
        /// Exception name.
        name: String,
        /// Exception message.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an endpoint parse error.
    #[inline]
    pub fn endpoint_parse(message: impl Into<String>) -> Self {
        Self::EndpointParse {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection closed error.
    #[inline]
    pub fn connection_closed(ws_name: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            ws_name: ws_name.into(),
        }
    }

    /// Creates a connection lost error.
    #[inline]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an object-not-exist error for an identity.
    #[inline]
    pub fn object_not_exist(identity: &str) -> Self {
        Self::ObjectNotExist {
            message: format!("no servant registered as '{identity}'"),
        }
    }

    /// Creates an operation-not-exist error.
    #[inline]
    pub fn operation_not_exist(identity: &str, method: &str) -> Self {
        Self::OperationNotExist {
            message: format!("'{identity}' has no method '{method}'"),
        }
    }

    /// Creates an unknown local exception.
    #[inline]
    pub fn unknown_local(message: impl Into<String>) -> Self {
        Self::UnknownLocal {
            message: message.into(),
        }
    }

    /// Creates an already-used-endpoint error.
    #[inline]
    pub fn already_used_endpoint(ws_name: &str) -> Self {
        Self::AlreadyUsedEndpoint {
            message: format!("endpoint '{ws_name}' is already in use"),
        }
    }

    /// Creates an already-registered error.
    #[inline]
    pub fn already_registered(message: impl Into<String>) -> Self {
        Self::AlreadyRegistered {
            message: message.into(),
        }
    }

    /// Creates a type error.
    #[inline]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError {
            message: message.into(),
        }
    }

    /// Creates an application-defined error raised by servant code.
    ///
    /// The name travels to the caller unchanged.
    #[inline]
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Wire Conversion
// ============================================================================

impl Error {
    /// Returns the wire exception name for this error.
    ///
    /// External errors (IO, JSON, WebSocket) have no name of their own and
    /// are reported as `UnknownLocalException`.
    #[must_use]
    pub fn exception_name(&self) -> &str {
        match self {
            Self::Protocol { .. } | Self::Json(_) => PROTOCOL_EXCEPTION,
            Self::EndpointParse { .. } => ENDPOINT_PARSE_EXCEPTION,
            Self::ObjectNotExist { .. } => OBJECT_NOT_EXIST_EXCEPTION,
            Self::OperationNotExist { .. } => OPERATION_NOT_EXIST_EXCEPTION,
            Self::AlreadyUsedEndpoint { .. } => ALREADY_USED_ENDPOINT,
            Self::AlreadyRegistered { .. } => ALREADY_REGISTERED_EXCEPTION,
            Self::AlreadyResolved => ALREADY_RESOLVED_EXCEPTION,
            Self::TypeError { .. } => TYPE_ERROR,
            Self::ConnectionClosed { .. } => CONNECTION_CLOSED_EXCEPTION,
            Self::ConnectionLost { .. } => CONNECTION_LOST_EXCEPTION,
            Self::Remote { name, .. } => name,
            Self::Config { .. }
            | Self::Connection { .. }
            | Self::InvalidArgument { .. }
            | Self::UnknownLocal { .. }
            | Self::Io(_)
            | Self::WebSocket(_)
            | Self::ChannelClosed(_) => UNKNOWN_LOCAL_EXCEPTION,
        }
    }

    /// Converts this error into its wire representation.
    #[must_use]
    pub fn to_exception(&self) -> WiseException {
        let message = match self {
            Self::Config { message }
            | Self::EndpointParse { message }
            | Self::Connection { message }
            | Self::ConnectionLost { message }
            | Self::Protocol { message }
            | Self::InvalidArgument { message }
            | Self::ObjectNotExist { message }
            | Self::OperationNotExist { message }
            | Self::UnknownLocal { message }
            | Self::AlreadyUsedEndpoint { message }
            | Self::AlreadyRegistered { message }
            | Self::TypeError { message }
            | Self::Remote { message, .. } => message.clone(),
            Self::ConnectionClosed { ws_name } => ws_name.clone(),
            other => other.to_string(),
        };

        WiseException::new(self.exception_name(), message)
    }
}

impl From<WiseException> for Error {
    fn from(exception: WiseException) -> Self {
        let WiseException { name, message } = exception;
        match name.as_str() {
            PROTOCOL_EXCEPTION => Self::Protocol { message },
            ENDPOINT_PARSE_EXCEPTION => Self::EndpointParse { message },
            OBJECT_NOT_EXIST_EXCEPTION => Self::ObjectNotExist { message },
            OPERATION_NOT_EXIST_EXCEPTION => Self::OperationNotExist { message },
            ALREADY_USED_ENDPOINT => Self::AlreadyUsedEndpoint { message },
            ALREADY_REGISTERED_EXCEPTION => Self::AlreadyRegistered { message },
            ALREADY_RESOLVED_EXCEPTION => Self::AlreadyResolved,
            TYPE_ERROR => Self::TypeError { message },
            UNKNOWN_LOCAL_EXCEPTION => Self::UnknownLocal { message },
            CONNECTION_CLOSED_EXCEPTION => Self::ConnectionClosed { ws_name: message },
            CONNECTION_LOST_EXCEPTION => Self::ConnectionLost { message },
            _ => Self::Remote { name, message },
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed { .. }
                | Self::ConnectionLost { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the target object or operation was not found.
    #[inline]
    #[must_use]
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotExist { .. } | Self::OperationNotExist { .. }
        )
    }

    /// Returns `true` if retrying the call later may succeed.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
