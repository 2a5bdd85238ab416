//! Wire protocol: JSON text frames and value encoding.
//!
//! Every frame is one JSON object. A socket carries both directions, so a
//! peer may interleave its own requests with replies to ours.
//!
//! # Message Shapes
//!
//! | Shape | Keys | Meaning |
//! |-------|------|---------|
//! | Request | `request_id`, `identity`, `method`, `params` | Invoke a method on an object |
//! | Success | `request_id`, `result` | The call returned |
//! | Failure | `request_id`, `error: [name, message]` | The call failed |
//!
//! # Reserved Names
//!
//! | Name | Value | Purpose |
//! |------|-------|---------|
//! | [`INTROSPECTION_METHOD`] | `_get_methods` | Lists a servant's methods |
//! | [`ADMIN_IDENTITY`] | `WiseAdmin` | Hub servant provisioning channels |
//! | [`ADMIN_WS_NAME`] | `WiseAdmin` | Hub channel hosting the admin servant |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Request, Reply and Incoming frames |
//! | `value` | Values, object references and their encoding |

// ============================================================================
// Submodules
// ============================================================================

/// Request and reply frames.
pub mod message;

/// Values and the proxy encoding.
pub mod value;

// ============================================================================
// Reserved Names
// ============================================================================

/// Method every servant answers with its method names.
pub const INTROSPECTION_METHOD: &str = "_get_methods";

/// Identity of the hub's provisioning servant.
pub const ADMIN_IDENTITY: &str = "WiseAdmin";

/// Channel name the provisioning servant is reachable on.
pub const ADMIN_WS_NAME: &str = "WiseAdmin";

/// Admin method creating a channel for an adapter.
pub const CREATE_SOCKET_METHOD: &str = "create_socket";

/// Admin method removing a channel.
pub const REMOVE_SOCKET_METHOD: &str = "remove_socket";

/// Admin method listing provisioned channels.
pub const LIST_SOCKETS_METHOD: &str = "list_sockets";

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{Incoming, Invocation, Reply, Request};
pub use value::{
    Args, ProxyResolver, Value, contains_reference, marshal, marshal_all, proxy_repr, unmarshal,
    unmarshal_all,
};
