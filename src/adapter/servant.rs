//! Servants and the identity table they are registered in.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{Args, INTROSPECTION_METHOD, Invocation, Value};

// ============================================================================
// Types
// ============================================================================

/// Future returned by a servant method.
pub type MethodFuture = BoxFuture<'static, Result<Value>>;

/// A callable servant method.
type Method = Arc<dyn Fn(Args) -> MethodFuture + Send + Sync>;

// ============================================================================
// Servant
// ============================================================================

/// A local object exposing named methods.
///
/// Methods receive positional [`Args`] and return anything convertible into
/// a [`Value`]. Returning `Err` sends an error reply; use
/// [`Error::remote`] for application-defined exception names.
///
/// # Example
///
/// ```ignore
/// let calc = Servant::new()
///     .with_method("add", |args| Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
///     .with_async_method("slow_add", |args| async move {
///         tokio::time::sleep(Duration::from_millis(10)).await;
///         Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?)
///     });
/// ```
#[derive(Clone, Default)]
pub struct Servant {
    methods: BTreeMap<String, Method>,
}

impl Servant {
    /// Creates a servant without methods.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a synchronous method.
    #[must_use]
    pub fn with_method<F, V>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Args) -> Result<V> + Send + Sync + 'static,
        V: Into<Value>,
    {
        let method: Method = Arc::new(move |args| {
            let result = method(args).map(Into::into);
            Box::pin(async move { result })
        });
        self.methods.insert(name.into(), method);
        self
    }

    /// Adds an asynchronous method.
    #[must_use]
    pub fn with_async_method<F, Fut, V>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
        V: Into<Value>,
    {
        let method: Method = Arc::new(move |args| {
            let future = method(args);
            Box::pin(async move { future.await.map(Into::into) })
        });
        self.methods.insert(name.into(), method);
        self
    }

    /// Returns the names of the servant's own methods, sorted.
    ///
    /// The introspection method is not included.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        self.methods
            .keys()
            .filter(|name| name.as_str() != INTROSPECTION_METHOD)
            .cloned()
            .collect()
    }

    /// Returns `true` if the servant answers `method`.
    #[inline]
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Installs the introspection method listing the other methods.
    fn inject_introspection(&mut self) {
        let names = Value::from(serde_json::Value::from(self.method_names()));
        let method: Method = Arc::new(move |_| {
            let names = names.clone();
            Box::pin(async move { Ok(names) })
        });
        self.methods.insert(INTROSPECTION_METHOD.to_string(), method);
    }

    /// Returns a handle to `method`.
    fn method(&self, method: &str) -> Option<Method> {
        self.methods.get(method).cloned()
    }
}

impl fmt::Debug for Servant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servant")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// ServantRegistry
// ============================================================================

/// Identity table dispatching invocations to servants.
///
/// Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct ServantRegistry {
    servants: Arc<RwLock<FxHashMap<String, Servant>>>,
}

impl ServantRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `servant` under `identity` and injects introspection.
    ///
    /// Returns the method names advertised for the identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if `identity` is taken, or
    /// [`Error::InvalidArgument`] if it is empty.
    pub fn add(&self, mut servant: Servant, identity: &str) -> Result<Vec<String>> {
        if identity.is_empty() || identity.chars().any(char::is_whitespace) {
            return Err(Error::invalid_argument(format!(
                "invalid identity '{identity}': must be non-empty without whitespace"
            )));
        }

        let mut servants = self.servants.write();
        if servants.contains_key(identity) {
            return Err(Error::already_registered(format!(
                "identity '{identity}' is already registered"
            )));
        }

        servant.inject_introspection();
        let names = servant.method_names();
        servants.insert(identity.to_string(), servant);

        debug!(%identity, methods = names.len(), "Servant registered");
        Ok(names)
    }

    /// Unregisters `identity`, returning its servant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotExist`] if nothing is registered there.
    pub fn remove(&self, identity: &str) -> Result<Servant> {
        let servant = self
            .servants
            .write()
            .remove(identity)
            .ok_or_else(|| Error::object_not_exist(identity))?;

        debug!(%identity, "Servant removed");
        Ok(servant)
    }

    /// Returns `true` if `identity` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.servants.read().contains_key(identity)
    }

    /// Returns the number of registered servants.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.servants.read().len()
    }

    /// Returns `true` if no servant is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servants.read().is_empty()
    }

    /// Runs an invocation against the registered servants.
    ///
    /// # Errors
    ///
    /// - [`Error::ObjectNotExist`] if no servant has the identity
    /// - [`Error::OperationNotExist`] if the servant lacks the method
    /// - Whatever the method itself returns
    pub async fn process_request(&self, invocation: Invocation) -> Result<Value> {
        let Invocation {
            identity,
            method,
            args,
        } = invocation;

        // Servant code may add or remove servants, so it runs unlocked.
        let target = {
            let servants = self.servants.read();
            let servant = servants
                .get(&identity)
                .ok_or_else(|| Error::object_not_exist(&identity))?;
            servant
                .method(&method)
                .ok_or_else(|| Error::operation_not_exist(&identity, &method))?
        };

        trace!(%identity, %method, "Dispatching");
        target(args).await
    }
}

impl fmt::Debug for ServantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servants = self.servants.read();
        f.debug_struct("ServantRegistry")
            .field("identities", &servants.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
