//! Client-side handles to remote objects.
//!
//! An [`ObjectPrx`] names a remote object by identity and endpoint and
//! carries the method list obtained from the object itself. Every call
//! becomes one wire request on the proxy's transceiver and returns a
//! [`Promise`].
//!
//! # Example
//!
//! ```ignore
//! let calc = communicator.string_to_proxy("calc -w calc -h localhost -p 9000").await?;
//! assert!(calc.has_method("add"));
//!
//! let sum: i64 = calc.call("add", vec![2.into(), 3.into()]).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::endpoint::{EndpointDefaults, EndpointInfo};
use crate::error::{Error, Result};
use crate::promise::{Promise, Settle};
use crate::protocol::{INTROSPECTION_METHOD, Value};
use crate::transport::Transceiver;

// ============================================================================
// ObjectPrx
// ============================================================================

/// A handle to a remote object.
///
/// Cheap to clone. Two proxies are equal when they name the same identity
/// at the same endpoint.
#[derive(Clone)]
pub struct ObjectPrx {
    /// Identity of the target object.
    identity: String,
    /// Endpoint the object is reachable through.
    endpoint: EndpointInfo,
    /// Transceiver carrying the calls.
    transceiver: Transceiver,
    /// Methods the object exposes, including introspection.
    methods: Arc<BTreeSet<String>>,
}

// ============================================================================
// ObjectPrx - Constructors
// ============================================================================

impl ObjectPrx {
    /// Creates a proxy exposing only the introspection method.
    pub(crate) fn bootstrap(
        identity: impl Into<String>,
        endpoint: EndpointInfo,
        transceiver: Transceiver,
    ) -> Self {
        Self::with_methods(identity, endpoint, transceiver, std::iter::empty::<String>())
    }

    /// Creates a proxy exposing `methods` plus introspection.
    pub(crate) fn with_methods<I, S>(
        identity: impl Into<String>,
        endpoint: EndpointInfo,
        transceiver: Transceiver,
        methods: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut methods: BTreeSet<String> = methods.into_iter().map(Into::into).collect();
        methods.insert(INTROSPECTION_METHOD.to_string());

        Self {
            identity: identity.into(),
            endpoint,
            transceiver,
            methods: Arc::new(methods),
        }
    }

    /// Splits `"<identity> <endpoint descriptor>"` into its parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointParse`] if the identity is missing or the
    /// endpoint part does not parse.
    pub fn split_repr(repr: &str, defaults: &EndpointDefaults) -> Result<(String, EndpointInfo)> {
        let repr = repr.trim();
        let (identity, descriptor) = repr
            .split_once(char::is_whitespace)
            .unwrap_or((repr, ""));

        if identity.is_empty() || identity.starts_with('-') {
            return Err(Error::endpoint_parse(format!(
                "missing identity in proxy string '{repr}'"
            )));
        }

        let endpoint = EndpointInfo::parse(descriptor, defaults, false)?;
        Ok((identity.to_string(), endpoint))
    }
}

// ============================================================================
// ObjectPrx - Accessors
// ============================================================================

impl ObjectPrx {
    /// Returns the identity of the remote object.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the endpoint of the remote object.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    /// Returns the transceiver carrying this proxy's calls.
    #[inline]
    #[must_use]
    pub fn transceiver(&self) -> &Transceiver {
        &self.transceiver
    }

    /// Returns the exposed method names in sorted order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Returns `true` if the remote object exposes `method`.
    #[inline]
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }
}

// ============================================================================
// ObjectPrx - Calls
// ============================================================================

impl ObjectPrx {
    /// Invokes `method` with positional params.
    ///
    /// Methods the object did not advertise are rejected locally with
    /// `OperationNotExistException`, without any wire traffic.
    #[must_use]
    pub fn invoke(&self, method: &str, params: Vec<Value>) -> Promise<Value> {
        if !self.has_method(method) {
            return Promise::rejected(Error::operation_not_exist(&self.identity, method));
        }

        self.transceiver.invoke(&self.identity, method, params)
    }

    /// Invokes `method` and deserializes the result into `R`.
    ///
    /// # Errors
    ///
    /// Returns the remote failure, or [`Error::InvalidArgument`] if the
    /// result does not match `R`.
    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<R> {
        self.invoke(method, params).await?.deserialize()
    }

    /// Asks the remote object for its method names.
    #[must_use]
    pub fn introspect(&self) -> Promise<Vec<String>> {
        self.invoke(INTROSPECTION_METHOD, Vec::new())
            .then(|value| Settle::from(value.deserialize::<Vec<String>>()))
    }
}

// ============================================================================
// ObjectPrx - Traits
// ============================================================================

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.identity, self.endpoint)
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPrx")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.endpoint == other.endpoint
    }
}

impl Eq for ObjectPrx {}

impl Hash for ObjectPrx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        self.endpoint.hash(state);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(identity: &str, methods: &[&str]) -> ObjectPrx {
        let endpoint = EndpointInfo::new("calc", "localhost", 9000);
        ObjectPrx::with_methods(
            identity,
            endpoint.clone(),
            Transceiver::detached(endpoint),
            methods.iter().copied(),
        )
    }

    #[test]
    fn test_display_is_wire_repr() {
        let proxy = detached("X", &["add"]);
        assert_eq!(proxy.to_string(), "X -w calc -h localhost -p 9000");
    }

    #[test]
    fn test_methods_include_introspection() {
        let proxy = detached("X", &["add", "sub"]);
        let methods: Vec<_> = proxy.methods().collect();
        assert_eq!(methods, vec![INTROSPECTION_METHOD, "add", "sub"]);
    }

    #[test]
    fn test_bootstrap_exposes_only_introspection() {
        let endpoint = EndpointInfo::new("calc", "localhost", 9000);
        let proxy = ObjectPrx::bootstrap("X", endpoint.clone(), Transceiver::detached(endpoint));
        assert!(proxy.has_method(INTROSPECTION_METHOD));
        assert_eq!(proxy.methods().count(), 1);
    }

    #[test]
    fn test_split_repr() {
        let defaults = EndpointDefaults::new("localhost", 9000);
        let (identity, endpoint) = ObjectPrx::split_repr("  X   -w calc ", &defaults).expect("valid");

        assert_eq!(identity, "X");
        assert_eq!(endpoint, EndpointInfo::new("calc", "localhost", 9000));
    }

    #[test]
    fn test_split_repr_requires_identity() {
        let defaults = EndpointDefaults::new("localhost", 9000);
        assert!(matches!(
            ObjectPrx::split_repr("-w calc", &defaults),
            Err(Error::EndpointParse { .. })
        ));
        assert!(ObjectPrx::split_repr("   ", &defaults).is_err());
    }

    #[test]
    fn test_equality_ignores_methods() {
        assert_eq!(detached("X", &["add"]), detached("X", &["mul"]));
        assert_ne!(detached("X", &["add"]), detached("Y", &["add"]));
    }

    #[tokio::test]
    async fn test_unknown_method_rejected_locally() {
        let proxy = detached("X", &["add"]);
        let err = proxy.invoke("mul", vec![]).await.unwrap_err();

        assert!(matches!(err, Error::OperationNotExist { .. }));
        assert_eq!(proxy.transceiver().pending_count(), 0);
    }
}
