//! Wise RPC - Bidirectional object-identity RPC over WebSocket.
//!
//! Objects registered in an [`ObjectAdapter`] are reachable from any peer
//! connected to the same [`Hub`]. Peers call them through [`ObjectPrx`]
//! handles built at runtime from the object's own method list. Proxies can
//! travel as call arguments and results, so callbacks work in both
//! directions over the same sockets.
//!
//! # Architecture
//!
//! - **Hub**: WebSocket relay; one channel per endpoint name, plus the
//!   `WiseAdmin` channel provisioning the others
//! - **Communicator**: per-process facade owning transceivers and adapters
//! - **Transceiver**: one socket, multiplexing outbound calls and inbound
//!   invocations, reconnecting after a loss
//!
//! Key design principles:
//!
//! - Every call returns a [`Promise`]: single resolution, callbacks always
//!   deferred, promises returned from handlers are adopted
//! - Replies are matched by `request_id`, never by arrival order
//! - Errors travel as [`WiseException`] `{name, message}` pairs
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use wise_rpc::{Communicator, Hub, Result, Servant};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let hub = Hub::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000).await?;
//!
//!     // Serve a calculator
//!     let server = Communicator::initialize("127.0.0.1", hub.port()).await?;
//!     let adapter = server.create_object_adapter("calc", "-w calc").await?;
//!     adapter.add(
//!         Servant::new().with_method("add", |args| {
//!             Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?)
//!         }),
//!         "X",
//!     )?;
//!
//!     // Call it from another communicator
//!     let client = Communicator::initialize("127.0.0.1", hub.port()).await?;
//!     let calc = client.string_to_proxy("X -w calc").await?;
//!     let sum: i64 = calc.call("add", vec![2.into(), 3.into()]).await?;
//!     assert_eq!(sum, 5);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | [`Servant`], [`ObjectAdapter`] |
//! | [`communicator`] | [`Communicator`] facade and builder |
//! | [`endpoint`] | [`EndpointInfo`] descriptor parsing |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`hub`] | [`Hub`] relay and admin object |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`promise`] | [`Promise`] with deferred dispatch and adoption |
//! | [`protocol`] | Wire messages and value encoding |
//! | [`proxy`] | [`ObjectPrx`] remote object handles |
//! | [`transport`] | Transceivers and their registry |

// ============================================================================
// Modules
// ============================================================================

/// Servants and object adapters.
///
/// - [`Servant`] - Table of named methods
/// - [`ObjectAdapter`] - Identity table bound to one endpoint
pub mod adapter;

/// Communicator facade.
///
/// Use [`Communicator::builder()`] or [`Communicator::initialize()`].
pub mod communicator;

/// Endpoint descriptors.
pub mod endpoint;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// WebSocket hub with channel provisioning.
pub mod hub;

/// Type-safe identifiers.
pub mod identifiers;

/// Single-resolution promises.
pub mod promise;

/// Wire protocol message types and value encoding.
pub mod protocol;

/// Remote object handles.
pub mod proxy;

/// WebSocket transport layer.
///
/// Transceivers own one socket each; the factory keeps one per endpoint.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Server side
pub use adapter::{ObjectAdapter, Servant, ServantRegistry};

// Communicator types
pub use communicator::{Communicator, CommunicatorBuilder};

// Endpoint types
pub use endpoint::{EndpointDefaults, EndpointInfo};

// Error types
pub use error::{Error, Result, WiseException};

// Hub
pub use hub::Hub;

// Identifier types
pub use identifiers::RequestId;

// Promise types
pub use promise::{Outcome, Promise, Settle};

// Protocol types
pub use protocol::{Args, Value};

// Proxy types
pub use proxy::ObjectPrx;

// Transport types
pub use transport::{ConnectionState, Role, Transceiver, TransceiverConfig, TransceiverEvent};
