//! WebSocket transport layer.
//!
//! A [`Transceiver`] owns one socket to one named channel on the hub and
//! carries calls in both directions. The [`TransceiverFactory`] keeps one
//! transceiver per channel name.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  ObjectPrx      │──► Transceiver ─┐            │                 │
//! │                 │                 │ WebSocket  │  Hub            │
//! │  ObjectAdapter  │◄── Transceiver ◄┴───────────►│  /<ws_name>     │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `TransceiverFactory::get_transceiver` - Connect as a client
//! 2. `TransceiverFactory::create_transceiver` - Provision, then connect as owner
//! 3. `Transceiver::ready` - Wait for the socket to open
//! 4. `Transceiver::invoke` - Send requests, receive replies and invocations
//! 5. `Transceiver::shutdown` - Close the socket and stop reconnecting
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `factory` | Transceiver registry by endpoint name |
//! | `transceiver` | WebSocket channel and event loop |

// ============================================================================
// Submodules
// ============================================================================

/// Transceiver registry.
pub mod factory;

/// WebSocket channel and event loop.
pub mod transceiver;

// ============================================================================
// Re-exports
// ============================================================================

pub use factory::TransceiverFactory;
pub use transceiver::{
    ConnectionState, InvocationHandler, ROLE_HEADER, Role, Transceiver, TransceiverConfig,
    TransceiverEvent,
};
