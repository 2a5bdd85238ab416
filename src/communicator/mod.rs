//! Communicator facade and configuration.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | [`CommunicatorBuilder`] for fluent configuration |
//! | `core` | [`Communicator`] facade |

// ============================================================================
// Submodules
// ============================================================================

/// Communicator builder.
pub mod builder;

/// Communicator facade.
pub mod core;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::CommunicatorBuilder;
pub use core::Communicator;
