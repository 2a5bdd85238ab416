//! Server side: servants and the adapters that host them.
//!
//! A [`Servant`] is a table of named methods. An [`ObjectAdapter`] maps
//! identities to servants and answers invocations arriving on its
//! endpoint's transceiver.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `object_adapter` | [`ObjectAdapter`] bound to one endpoint |
//! | `servant` | [`Servant`] and the [`ServantRegistry`] identity table |

// ============================================================================
// Submodules
// ============================================================================

/// Object adapter bound to one endpoint.
pub mod object_adapter;

/// Servants and the identity table.
pub mod servant;

// ============================================================================
// Re-exports
// ============================================================================

pub use object_adapter::ObjectAdapter;
pub use servant::{MethodFuture, Servant, ServantRegistry};
