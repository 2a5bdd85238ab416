//! Endpoint descriptors.
//!
//! An endpoint names one logical WebSocket channel as the triple
//! `(ws_name, host, port)`. Descriptors are written as order-independent
//! flag pairs:
//!
//! ```text
//! -w <ws_name> -h <host> -p <port>
//! ```
//!
//! Omitted host and port fall back to caller-supplied defaults. Adapter
//! endpoints may also omit `-w`, in which case a random name is generated.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Flag introducing the WebSocket channel name.
const WS_FLAG: &str = "-w";

/// Flag introducing the host.
const HOST_FLAG: &str = "-h";

/// Flag introducing the port.
const PORT_FLAG: &str = "-p";

// ============================================================================
// EndpointDefaults
// ============================================================================

/// Fallback host and port used when a descriptor omits them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointDefaults {
    /// Default host.
    pub host: Option<String>,
    /// Default port.
    pub port: Option<u16>,
}

impl EndpointDefaults {
    /// Creates defaults with both host and port set.
    #[inline]
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
        }
    }
}

// ============================================================================
// EndpointInfo
// ============================================================================

/// A parsed, validated endpoint.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointInfo {
    ws_name: String,
    host: String,
    port: u16,
}

impl EndpointInfo {
    /// Creates an endpoint from its parts.
    #[inline]
    #[must_use]
    pub fn new(ws_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ws_name: ws_name.into(),
            host: host.into(),
            port,
        }
    }

    /// Parses an endpoint descriptor.
    ///
    /// # Arguments
    ///
    /// * `descriptor` - Flag pairs, e.g. `-w calc -h localhost -p 9000`
    /// * `defaults` - Host and port used when the descriptor omits them
    /// * `is_adapter_endpoint` - Generate a random `ws_name` when absent
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointParse`] when a flag lacks its value, a flag
    /// repeats, an unrecognized token remains, the port is not numeric, or
    /// a required field is missing after applying defaults.
    pub fn parse(
        descriptor: &str,
        defaults: &EndpointDefaults,
        is_adapter_endpoint: bool,
    ) -> Result<Self> {
        let mut ws_name: Option<String> = None;
        let mut host: Option<String> = None;
        let mut port: Option<u16> = None;

        let mut tokens = descriptor.split_whitespace();
        while let Some(token) = tokens.next() {
            let slot = match token {
                WS_FLAG => &mut ws_name,
                HOST_FLAG => &mut host,
                PORT_FLAG => {
                    let value = Self::flag_value(token, tokens.next(), descriptor)?;
                    if port.is_some() {
                        return Err(Self::duplicate_flag(token, descriptor));
                    }
                    let parsed = value.parse::<u16>().map_err(|_| {
                        Error::endpoint_parse(format!(
                            "invalid port '{value}' in endpoint '{descriptor}'"
                        ))
                    })?;
                    port = Some(parsed);
                    continue;
                }
                other => {
                    return Err(Error::endpoint_parse(format!(
                        "unrecognized token '{other}' in endpoint '{descriptor}'"
                    )));
                }
            };

            let value = Self::flag_value(token, tokens.next(), descriptor)?;
            if slot.is_some() {
                return Err(Self::duplicate_flag(token, descriptor));
            }
            *slot = Some(value.to_string());
        }

        let ws_name = match ws_name {
            Some(name) => name,
            None if is_adapter_endpoint => Uuid::new_v4().simple().to_string(),
            None => {
                return Err(Error::endpoint_parse(format!(
                    "missing '-w <name>' in endpoint '{descriptor}'"
                )));
            }
        };

        let host = host.or_else(|| defaults.host.clone()).ok_or_else(|| {
            Error::endpoint_parse(format!(
                "missing '-h <host>' in endpoint '{descriptor}' and no default host"
            ))
        })?;

        let port = port.or(defaults.port).ok_or_else(|| {
            Error::endpoint_parse(format!(
                "missing '-p <port>' in endpoint '{descriptor}' and no default port"
            ))
        })?;

        Ok(Self {
            ws_name,
            host,
            port,
        })
    }

    /// Returns the WebSocket channel name.
    #[inline]
    #[must_use]
    pub fn ws_name(&self) -> &str {
        &self.ws_name
    }

    /// Returns the host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the WebSocket URL for this endpoint.
    ///
    /// Format: `ws://{host}:{port}/{ws_name}` with the name percent-encoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointParse`] if the host is not a valid URL host.
    pub fn ws_url(&self) -> Result<Url> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        let mut url = Url::parse(&format!("ws://{host}:{}/", self.port))
            .map_err(|e| Error::endpoint_parse(format!("invalid host '{}': {e}", self.host)))?;

        url.path_segments_mut()
            .map_err(|()| Error::endpoint_parse(format!("cannot build URL for '{self}'")))?
            .pop_if_empty()
            .push(&self.ws_name);

        Ok(url)
    }

    fn flag_value<'a>(flag: &str, value: Option<&'a str>, descriptor: &str) -> Result<&'a str> {
        value.ok_or_else(|| {
            Error::endpoint_parse(format!(
                "flag '{flag}' has no value in endpoint '{descriptor}'"
            ))
        })
    }

    fn duplicate_flag(flag: &str, descriptor: &str) -> Error {
        Error::endpoint_parse(format!(
            "flag '{flag}' given twice in endpoint '{descriptor}'"
        ))
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{WS_FLAG} {} {HOST_FLAG} {} {PORT_FLAG} {}",
            self.ws_name, self.host, self.port
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
