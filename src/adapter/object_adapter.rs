//! Object adapter bound to one provisioned endpoint.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::endpoint::EndpointInfo;
use crate::error::Result;
use crate::protocol::{Invocation, Value};
use crate::proxy::ObjectPrx;
use crate::transport::{InvocationHandler, Transceiver};

use super::servant::{Servant, ServantRegistry};

// ============================================================================
// ObjectAdapter
// ============================================================================

/// Dispatch table serving local servants on one endpoint.
///
/// Created by [`Communicator::create_object_adapter`](crate::Communicator::create_object_adapter),
/// which provisions the endpoint and binds the adapter to its transceiver.
/// Cheap to clone; clones share the servant table.
///
/// # Example
///
/// ```ignore
/// let adapter = communicator.create_object_adapter("calc", "-w calc").await?;
/// let proxy = adapter.add(calculator, "X")?;
/// println!("serving {proxy}");
/// ```
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    /// Adapter name, unique within its communicator.
    name: String,
    /// Endpoint the adapter serves.
    endpoint: EndpointInfo,
    /// Owner-side transceiver of the endpoint.
    transceiver: Transceiver,
    /// Registered servants.
    servants: ServantRegistry,
}

#[async_trait]
impl InvocationHandler for AdapterInner {
    async fn process_request(&self, invocation: Invocation) -> Result<Value> {
        self.servants.process_request(invocation).await
    }
}

// ============================================================================
// ObjectAdapter - Constructor
// ============================================================================

impl ObjectAdapter {
    /// Creates an adapter and routes the transceiver's invocations to it.
    pub(crate) fn bind(name: impl Into<String>, transceiver: Transceiver) -> Self {
        let inner = Arc::new(AdapterInner {
            name: name.into(),
            endpoint: transceiver.endpoint().clone(),
            transceiver,
            servants: ServantRegistry::new(),
        });

        let handler: Arc<dyn InvocationHandler> = inner.clone();
        let handler: Weak<dyn InvocationHandler> = Arc::downgrade(&handler);
        inner.transceiver.bind_handler(handler);

        info!(
            name = %inner.name,
            endpoint = %inner.endpoint,
            "Object adapter bound"
        );

        Self { inner }
    }
}

// ============================================================================
// ObjectAdapter - Public API
// ============================================================================

impl ObjectAdapter {
    /// Returns the adapter name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the endpoint the adapter serves.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &EndpointInfo {
        &self.inner.endpoint
    }

    /// Returns the number of registered servants.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.servants.len()
    }

    /// Returns `true` if no servant is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.servants.is_empty()
    }

    /// Returns `true` if `identity` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.inner.servants.contains(identity)
    }

    /// Registers `servant` under `identity` and returns a proxy to it.
    ///
    /// The proxy can be passed to remote peers as a call argument or
    /// result; they call back through this adapter's endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`](crate::Error::AlreadyRegistered)
    /// if `identity` is taken.
    pub fn add(&self, servant: Servant, identity: &str) -> Result<ObjectPrx> {
        let methods = self.inner.servants.add(servant, identity)?;

        Ok(ObjectPrx::with_methods(
            identity,
            self.inner.endpoint.clone(),
            self.inner.transceiver.clone(),
            methods,
        ))
    }

    /// Registers `servant` under a fresh random identity.
    ///
    /// # Errors
    ///
    /// Propagates registration failures from [`add`](Self::add).
    pub fn add_with_uuid(&self, servant: Servant) -> Result<ObjectPrx> {
        let identity = Uuid::new_v4().to_string();
        self.add(servant, &identity)
    }

    /// Unregisters `identity`, returning its servant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotExist`](crate::Error::ObjectNotExist) if
    /// nothing is registered under `identity`.
    pub fn remove(&self, identity: &str) -> Result<Servant> {
        self.inner.servants.remove(identity)
    }

    /// Runs an invocation against the registered servants.
    ///
    /// # Errors
    ///
    /// `ObjectNotExist` for an unknown identity, `OperationNotExist` for an
    /// unknown method, or the servant's own error.
    pub async fn process_request(&self, invocation: Invocation) -> Result<Value> {
        self.inner.process_request(invocation).await
    }
}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.endpoint)
            .field("servants", &self.inner.servants)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
