//! Builder pattern for communicator configuration.
//!
//! # Example
//!
//! ```ignore
//! let communicator = Communicator::builder()
//!     .host("localhost")
//!     .port(9000)
//!     .retry_attempts(5)
//!     .initialize()
//!     .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::endpoint::EndpointDefaults;
use crate::error::{Error, Result};
use crate::promise::Promise;
use crate::transport::TransceiverConfig;

use super::core::Communicator;

// ============================================================================
// CommunicatorBuilder
// ============================================================================

/// Builder for configuring a [`Communicator`].
///
/// Use [`Communicator::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct CommunicatorBuilder {
    /// Hub host used when a descriptor omits `-h`.
    host: Option<String>,
    /// Hub port used when a descriptor omits `-p`.
    port: Option<u16>,
    /// Reconnection policy for every transceiver.
    config: TransceiverConfig,
}

// ============================================================================
// CommunicatorBuilder Implementation
// ============================================================================

impl CommunicatorBuilder {
    /// Creates a builder with the default reconnection policy.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default hub host.
    #[inline]
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the default hub port.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables or disables reconnection after a socket closes.
    #[inline]
    #[must_use]
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Sets the number of reconnection attempts per outage.
    #[inline]
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets the delay between reconnection attempts.
    #[inline]
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Creates the communicator without contacting the hub.
    ///
    /// Proxies can be resolved, but adapters cannot be created until the
    /// admin object is known; use [`initialize`](Self::initialize) for that.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the retry interval is zero while
    /// reconnection is enabled.
    pub fn build(self) -> Result<Communicator> {
        self.validate()?;
        let defaults = EndpointDefaults {
            host: self.host,
            port: self.port,
        };
        Ok(Communicator::new(defaults, self.config))
    }

    /// Creates the communicator and resolves the hub's admin object.
    ///
    /// The returned promise fulfills once the communicator is ready for
    /// adapter creation.
    #[must_use]
    pub fn initialize(self) -> Promise<Communicator> {
        match self.build() {
            Ok(communicator) => communicator.bootstrap(),
            Err(e) => Promise::rejected(e),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

impl CommunicatorBuilder {
    fn validate(&self) -> Result<()> {
        if self.config.reconnect && self.config.retry_interval.is_zero() {
            return Err(Error::config(
                "retry interval must be positive when reconnection is enabled",
            ));
        }

        if self.host.as_deref().is_some_and(str::is_empty) {
            return Err(Error::config("default host must not be empty"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_default_builder() {
        let builder = CommunicatorBuilder::new();
        assert!(builder.host.is_none());
        assert!(builder.port.is_none());
        assert_eq!(builder.config, TransceiverConfig::default());
    }

    #[test]
    fn test_setters() {
        let builder = CommunicatorBuilder::new()
            .host("localhost")
            .port(9000)
            .reconnect(false)
            .retry_attempts(3)
            .retry_interval(Duration::from_millis(50));

        assert_eq!(builder.host.as_deref(), Some("localhost"));
        assert_eq!(builder.port, Some(9000));
        assert!(!builder.config.reconnect);
        assert_eq!(builder.config.max_attempts, 3);
        assert_eq!(builder.config.retry_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = CommunicatorBuilder::new()
            .retry_interval(Duration::ZERO)
            .validate();
        assert!(matches!(result, Err(Error::Config { .. })));

        let result = CommunicatorBuilder::new()
            .reconnect(false)
            .retry_interval(Duration::ZERO)
            .validate();
        assert!(result.is_ok());
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(CommunicatorBuilder::new().host("").validate().is_err());
    }

    #[tokio::test]
    async fn test_initialize_without_hub_address_fails() {
        let err = CommunicatorBuilder::new().initialize().await.unwrap_err();
        assert!(matches!(err, Error::EndpointParse { .. }));
    }
}
