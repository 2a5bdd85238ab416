//! Request and reply message types.
//!
//! Defines the JSON text frames exchanged over a transceiver's socket.
//! The same socket carries both directions: a peer may send requests and
//! replies interleaved.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result, WiseException};
use crate::identifiers::RequestId;

use super::value::Args;

// ============================================================================
// Field Names
// ============================================================================

/// Key present in every message.
const REQUEST_ID_KEY: &str = "request_id";

/// Key marking an invocation.
const METHOD_KEY: &str = "method";

/// Key marking a success reply.
const RESULT_KEY: &str = "result";

/// Key marking a failure reply.
const ERROR_KEY: &str = "error";

// ============================================================================
// Request
// ============================================================================

/// An invocation of `method` on the object named `identity`.
///
/// # Format
///
/// ```json
/// {
///   "request_id": 1,
///   "identity": "calc",
///   "method": "add",
///   "params": [2, 3]
/// }
/// ```
///
/// Params are already marshalled: object references appear in their
/// tagged proxy form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, assigned by the sending transceiver.
    pub request_id: RequestId,

    /// Target servant identity.
    pub identity: String,

    /// Method name.
    pub method: String,

    /// Positional, marshalled parameters.
    #[serde(default)]
    pub params: Vec<JsonValue>,
}

impl Request {
    /// Creates a request with a placeholder id.
    ///
    /// The transceiver replaces the id when the request is sent.
    #[inline]
    #[must_use]
    pub fn new(identity: impl Into<String>, method: impl Into<String>, params: Vec<JsonValue>) -> Self {
        Self {
            request_id: RequestId::new(0),
            identity: identity.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns the request with the given id.
    #[inline]
    #[must_use]
    pub fn with_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }
}

// ============================================================================
// Reply
// ============================================================================

/// A reply to a previously received request.
///
/// # Format
///
/// Success:
/// ```json
/// { "request_id": 1, "result": 5 }
/// ```
///
/// Failure:
/// ```json
/// { "request_id": 1, "error": ["ObjectNotExistException", "no servant registered as 'calc'"] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    /// The call completed with a result.
    Success {
        /// Id of the request being answered.
        request_id: RequestId,
        /// Marshalled result value.
        result: JsonValue,
    },
    /// The call failed.
    Failure {
        /// Id of the request being answered.
        request_id: RequestId,
        /// `[name, message]` pair.
        error: (String, String),
    },
}

impl Reply {
    /// Creates a success reply.
    #[inline]
    #[must_use]
    pub fn success(request_id: RequestId, result: JsonValue) -> Self {
        Self::Success { request_id, result }
    }

    /// Creates a failure reply.
    #[inline]
    #[must_use]
    pub fn failure(request_id: RequestId, exception: WiseException) -> Self {
        Self::Failure {
            request_id,
            error: exception.into_pair(),
        }
    }

    /// Returns the id of the request being answered.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Success { request_id, .. } | Self::Failure { request_id, .. } => *request_id,
        }
    }

    /// Returns the reply re-addressed to `request_id`.
    #[must_use]
    pub fn with_request_id(self, request_id: RequestId) -> Self {
        match self {
            Self::Success { result, .. } => Self::Success { request_id, result },
            Self::Failure { error, .. } => Self::Failure { request_id, error },
        }
    }

    /// Returns `true` if this is a success reply.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Converts the reply into the call outcome.
    pub fn into_outcome(self) -> std::result::Result<JsonValue, WiseException> {
        match self {
            Self::Success { result, .. } => Ok(result),
            Self::Failure { error, .. } => Err(WiseException::from(error)),
        }
    }
}

// ============================================================================
// Incoming
// ============================================================================

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// The peer invokes a local object.
    Invocation(Request),
    /// The peer answers one of our requests.
    Reply(Reply),
}

impl Incoming {
    /// Decodes a text frame.
    ///
    /// The shape is chosen by key presence: `method` means an invocation,
    /// `result` a success reply, `error` a failure reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the frame is not JSON
    /// - [`Error::Protocol`] if the frame matches none of the shapes or a
    ///   field has the wrong type
    pub fn parse(text: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(text)?;
        let JsonValue::Object(mut fields) = value else {
            return Err(Error::protocol("message is not a JSON object"));
        };

        if fields.contains_key(METHOD_KEY) {
            let request = serde_json::from_value(JsonValue::Object(fields))
                .map_err(|e| Error::protocol(format!("malformed request: {e}")))?;
            return Ok(Self::Invocation(request));
        }

        let request_id = Self::request_id(&fields)?;

        if let Some(result) = fields.remove(RESULT_KEY) {
            return Ok(Self::Reply(Reply::Success { request_id, result }));
        }

        if let Some(error) = fields.remove(ERROR_KEY) {
            let error: (String, String) = serde_json::from_value(error)
                .map_err(|e| Error::protocol(format!("malformed error reply: {e}")))?;
            return Ok(Self::Reply(Reply::Failure { request_id, error }));
        }

        Err(Error::protocol(format!(
            "message {request_id} has neither '{METHOD_KEY}', '{RESULT_KEY}' nor '{ERROR_KEY}'"
        )))
    }

    fn request_id(fields: &Map<String, JsonValue>) -> Result<RequestId> {
        fields
            .get(REQUEST_ID_KEY)
            .and_then(JsonValue::as_u64)
            .map(RequestId::new)
            .ok_or_else(|| Error::protocol("message without a numeric 'request_id'"))
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// An unmarshalled invocation, as handed to an object adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Target servant identity.
    pub identity: String,
    /// Method name.
    pub method: String,
    /// Positional arguments with object references resolved.
    pub args: Args,
}

impl Invocation {
    /// Creates an invocation.
    #[inline]
    #[must_use]
    pub fn new(identity: impl Into<String>, method: impl Into<String>, args: impl Into<Args>) -> Self {
        Self {
            identity: identity.into(),
            method: method.into(),
            args: args.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = Request::new("calc", "add", vec![json!(2), json!(3)]).with_id(RequestId::new(7));
        let json = serde_json::to_value(&request).expect("serialize");

        assert_eq!(
            json,
            json!({"request_id": 7, "identity": "calc", "method": "add", "params": [2, 3]})
        );
    }

    #[test]
    fn test_reply_serialization() {
        let success = serde_json::to_value(Reply::success(RequestId::new(1), json!(5))).expect("serialize");
        assert_eq!(success, json!({"request_id": 1, "result": 5}));

        let failure = Reply::failure(
            RequestId::new(2),
            WiseException::new("ObjectNotExistException", "gone"),
        );
        let failure = serde_json::to_value(failure).expect("serialize");
        assert_eq!(
            failure,
            json!({"request_id": 2, "error": ["ObjectNotExistException", "gone"]})
        );
    }

    #[test]
    fn test_parse_invocation() {
        let incoming = Incoming::parse(
            r#"{"request_id": 3, "identity": "calc", "method": "add", "params": [1, 2]}"#,
        )
        .expect("parse");

        let Incoming::Invocation(request) = incoming else {
            panic!("expected invocation");
        };
        assert_eq!(request.request_id, RequestId::new(3));
        assert_eq!(request.method, "add");
        assert_eq!(request.params, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_parse_invocation_without_params() {
        let incoming =
            Incoming::parse(r#"{"request_id": 3, "identity": "calc", "method": "reset"}"#)
                .expect("parse");
        assert!(matches!(incoming, Incoming::Invocation(ref r) if r.params.is_empty()));
    }

    #[test]
    fn test_parse_null_result_is_success() {
        let incoming = Incoming::parse(r#"{"request_id": 4, "result": null}"#).expect("parse");
        assert_eq!(
            incoming,
            Incoming::Reply(Reply::success(RequestId::new(4), JsonValue::Null))
        );
    }

    #[test]
    fn test_parse_error_reply() {
        let incoming = Incoming::parse(
            r#"{"request_id": 5, "error": ["OperationNotExistException", "no mul"]}"#,
        )
        .expect("parse");

        let Incoming::Reply(reply) = incoming else {
            panic!("expected reply");
        };
        assert!(!reply.is_success());
        let err = reply.into_outcome().unwrap_err();
        assert_eq!(err.name, "OperationNotExistException");
        assert_eq!(err.message, "no mul");
    }

    #[test]
    fn test_parse_unrecognized_shape_is_protocol_error() {
        let err = Incoming::parse(r#"{"request_id": 6, "something": 1}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_parse_non_object_is_protocol_error() {
        let err = Incoming::parse("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_parse_malformed_error_pair() {
        let err = Incoming::parse(r#"{"request_id": 6, "error": "oops"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
