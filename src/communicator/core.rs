//! Communicator facade.
//!
//! The [`Communicator`] owns the transceiver registry and the adapter
//! table. It resolves stringified references into live proxies and creates
//! object adapters on provisioned endpoints.
//!
//! # Example
//!
//! ```ignore
//! let communicator = Communicator::initialize("localhost", 9000).await?;
//!
//! let adapter = communicator.create_object_adapter("calc", "-w calc").await?;
//! adapter.add(calculator, "X")?;
//!
//! let proxy = communicator.string_to_proxy("X -w calc").await?;
//! let sum: i64 = proxy.call("add", vec![2.into(), 3.into()]).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::adapter::ObjectAdapter;
use crate::endpoint::{EndpointDefaults, EndpointInfo};
use crate::error::{Error, Result};
use crate::promise::{Promise, Settle};
use crate::protocol::{ADMIN_IDENTITY, ADMIN_WS_NAME, ProxyResolver};
use crate::proxy::ObjectPrx;
use crate::transport::{TransceiverConfig, TransceiverEvent, TransceiverFactory};

use super::builder::CommunicatorBuilder;

// ============================================================================
// Types
// ============================================================================

/// Entry in the adapter table.
enum AdapterSlot {
    /// Name reserved while its endpoint is being provisioned.
    Pending,
    /// Adapter ready to serve.
    Ready(ObjectAdapter),
}

/// Internal shared state for the communicator.
pub(crate) struct CommunicatorInner {
    /// Host and port for descriptors that omit them.
    defaults: EndpointDefaults,

    /// Transceivers by endpoint name.
    factory: TransceiverFactory,

    /// Adapters by name.
    adapters: Mutex<FxHashMap<String, AdapterSlot>>,

    /// Admin object, set once bootstrapping succeeds.
    admin: OnceLock<ObjectPrx>,
}

#[async_trait]
impl ProxyResolver for CommunicatorInner {
    async fn resolve_proxy(&self, repr: &str) -> Result<ObjectPrx> {
        self.string_to_proxy(repr).await
    }
}

impl CommunicatorInner {
    fn string_to_proxy(&self, descriptor: &str) -> Promise<ObjectPrx> {
        let (identity, endpoint) = match ObjectPrx::split_repr(descriptor, &self.defaults) {
            Ok(parts) => parts,
            Err(e) => return Promise::rejected(e),
        };

        debug!(%identity, ws_name = %endpoint.ws_name(), "Resolving proxy");

        self.factory.get_transceiver(&endpoint).then(move |transceiver| {
            let bootstrap =
                ObjectPrx::bootstrap(identity.clone(), endpoint.clone(), transceiver.clone());

            Settle::Adopt(bootstrap.introspect().map(move |methods| {
                ObjectPrx::with_methods(identity, endpoint, transceiver, methods)
            }))
        })
    }

    fn release_adapter_name(&self, name: &str) {
        let mut adapters = self.adapters.lock();
        if matches!(adapters.get(name), Some(AdapterSlot::Pending)) {
            adapters.remove(name);
        }
    }
}

// ============================================================================
// Communicator
// ============================================================================

/// Entry point of the runtime.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Communicator {
    /// Shared inner state.
    pub(crate) inner: Arc<CommunicatorInner>,
}

// ============================================================================
// Communicator - Display
// ============================================================================

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("defaults", &self.inner.defaults)
            .field("transceiver_count", &self.inner.factory.len())
            .field("adapter_count", &self.adapter_count())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Communicator - Constructors
// ============================================================================

impl Communicator {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::new()
    }

    /// Connects to the hub at `host:port` and resolves its admin object.
    ///
    /// Shorthand for `Communicator::builder().host(host).port(port).initialize()`.
    #[must_use]
    pub fn initialize(host: impl Into<String>, port: u16) -> Promise<Self> {
        Self::builder().host(host).port(port).initialize()
    }

    pub(crate) fn new(defaults: EndpointDefaults, config: TransceiverConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<CommunicatorInner>| {
            let resolver: Weak<dyn ProxyResolver> = weak.clone();
            CommunicatorInner {
                defaults,
                factory: TransceiverFactory::new(config, resolver),
                adapters: Mutex::new(FxHashMap::default()),
                admin: OnceLock::new(),
            }
        });

        Self { inner }
    }

    /// Resolves the admin object, then fulfills with the communicator.
    pub(crate) fn bootstrap(self) -> Promise<Self> {
        let descriptor = format!("{ADMIN_IDENTITY} -w {ADMIN_WS_NAME}");

        self.string_to_proxy(&descriptor).map(move |admin| {
            info!(endpoint = %admin.endpoint(), "Communicator initialized");
            let _ = self.inner.admin.set(admin);
            self
        })
    }
}

// ============================================================================
// Communicator - Public API
// ============================================================================

impl Communicator {
    /// Returns the host and port applied to incomplete descriptors.
    #[inline]
    #[must_use]
    pub fn defaults(&self) -> &EndpointDefaults {
        &self.inner.defaults
    }

    /// Returns `true` once the admin object has been resolved.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.admin.get().is_some()
    }

    /// Returns the hub's admin object.
    #[inline]
    #[must_use]
    pub fn admin(&self) -> Option<&ObjectPrx> {
        self.inner.admin.get()
    }

    /// Returns the number of ready adapters.
    #[must_use]
    pub fn adapter_count(&self) -> usize {
        self.inner
            .adapters
            .lock()
            .values()
            .filter(|slot| matches!(slot, AdapterSlot::Ready(_)))
            .count()
    }

    /// Returns the adapter named `name`.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<ObjectAdapter> {
        match self.inner.adapters.lock().get(name) {
            Some(AdapterSlot::Ready(adapter)) => Some(adapter.clone()),
            _ => None,
        }
    }

    /// Subscribes to connection events of every transceiver.
    #[must_use]
    pub fn connection_events(&self) -> broadcast::Receiver<TransceiverEvent> {
        self.inner.factory.subscribe()
    }

    /// Resolves `"<identity> <endpoint descriptor>"` into a proxy.
    ///
    /// Connects to the endpoint if needed, asks the object for its methods
    /// and returns a proxy exposing exactly those plus introspection.
    #[must_use]
    pub fn string_to_proxy(&self, descriptor: &str) -> Promise<ObjectPrx> {
        self.inner.string_to_proxy(descriptor)
    }

    /// Creates an adapter serving on `endpoint`.
    ///
    /// The descriptor may omit `-w`, in which case a random channel name
    /// is generated. The channel is provisioned through the admin object
    /// before the adapter connects as its owner.
    ///
    /// Rejects with `AlreadyRegisteredException` for a duplicate name and
    /// with `AlreadyUsedEndpoint` for an endpoint already in use.
    #[must_use]
    pub fn create_object_adapter(&self, name: &str, endpoint: &str) -> Promise<ObjectAdapter> {
        {
            let mut adapters = self.inner.adapters.lock();
            if adapters.contains_key(name) {
                return Promise::rejected(Error::already_registered(format!(
                    "adapter '{name}' already exists"
                )));
            }
            adapters.insert(name.to_string(), AdapterSlot::Pending);
        }

        let prepared = self.prepare_adapter_endpoint(endpoint);
        let (endpoint, admin) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                self.inner.release_adapter_name(name);
                return Promise::rejected(e);
            }
        };

        debug!(%name, %endpoint, "Creating object adapter");

        let on_ready = {
            let inner = Arc::clone(&self.inner);
            let name = name.to_string();
            move |transceiver| {
                let adapter = ObjectAdapter::bind(name.clone(), transceiver);
                inner
                    .adapters
                    .lock()
                    .insert(name, AdapterSlot::Ready(adapter.clone()));
                Settle::Fulfill(adapter)
            }
        };

        let on_failed = {
            let inner = Arc::clone(&self.inner);
            let name = name.to_string();
            move |exception| {
                inner.release_adapter_name(&name);
                Settle::Reject(exception)
            }
        };

        self.inner
            .factory
            .create_transceiver(&endpoint, &admin)
            .then_or(on_ready, on_failed)
    }

    /// Closes every socket and stops reconnecting.
    pub fn shutdown(&self) {
        info!(
            transceivers = self.inner.factory.len(),
            "Communicator shutting down"
        );
        self.inner.factory.shutdown();
    }
}

// ============================================================================
// Communicator - Internal
// ============================================================================

impl Communicator {
    fn prepare_adapter_endpoint(&self, descriptor: &str) -> Result<(EndpointInfo, ObjectPrx)> {
        let endpoint = EndpointInfo::parse(descriptor, &self.inner.defaults, true)?;

        let admin = self.inner.admin.get().cloned().ok_or_else(|| {
            Error::config("communicator is not initialized; the admin object is unknown")
        })?;

        Ok((endpoint, admin))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use serde_json::json;

    use crate::adapter::Servant;
    use crate::hub::Hub;
    use crate::protocol::{INTROSPECTION_METHOD, Value};
    use crate::transport::{ConnectionState, Role};

    async fn hub() -> Hub {
        Hub::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("hub")
    }

    async fn communicator(hub: &Hub) -> Communicator {
        Communicator::builder()
            .host("127.0.0.1")
            .port(hub.port())
            .retry_interval(Duration::from_millis(50))
            .retry_attempts(2)
            .initialize()
            .await
            .expect("initialize")
    }

    fn calculator() -> Servant {
        Servant::new()
            .with_method("add", |args| Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
            .with_method("div", |args| {
                let a: i64 = args.arg(0)?;
                let b: i64 = args.arg(1)?;
                if b == 0 {
                    return Err(Error::remote("DivisionByZero", "cannot divide by zero"));
                }
                Ok(a / b)
            })
    }

    #[tokio::test]
    async fn test_add_end_to_end() {
        let hub = hub().await;
        let server = communicator(&hub).await;
        let client = communicator(&hub).await;

        let adapter = server
            .create_object_adapter("calc", "-w calc")
            .await
            .expect("adapter");
        adapter.add(calculator(), "X").expect("servant");

        let descriptor = format!("X -w calc -h 127.0.0.1 -p {}", hub.port());
        let proxy = client.string_to_proxy(&descriptor).await.expect("proxy");

        let methods: Vec<_> = proxy.methods().collect();
        assert_eq!(methods, vec![INTROSPECTION_METHOD, "add", "div"]);

        let sum: i64 = proxy
            .call("add", vec![2.into(), 3.into()])
            .await
            .expect("add");
        assert_eq!(sum, 5);

        let err = proxy.call::<i64>("div", vec![1.into(), 0.into()]).await.unwrap_err();
        assert_eq!(err.to_exception().name, "DivisionByZero");

        client.shutdown();
        server.shutdown();
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_identity_rejected_remotely() {
        let hub = hub().await;
        let server = communicator(&hub).await;
        let client = communicator(&hub).await;

        server
            .create_object_adapter("calc", "-w calc")
            .await
            .expect("adapter");

        let err = client.string_to_proxy("Nobody -w calc").await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotExist { .. }));

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_adapter_name_rejected() {
        let hub = hub().await;
        let communicator = communicator(&hub).await;

        communicator
            .create_object_adapter("calc", "-w calc")
            .await
            .expect("first");

        let err = communicator
            .create_object_adapter("calc", "-w other")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered { .. }));
        assert_eq!(communicator.adapter_count(), 1);

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_endpoint_in_use_rejected() {
        let hub = hub().await;
        let first = communicator(&hub).await;
        let second = communicator(&hub).await;

        first
            .create_object_adapter("a", "-w calc")
            .await
            .expect("first");

        let err = second
            .create_object_adapter("b", "-w calc")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyUsedEndpoint { .. }));

        // The failed name is free again.
        second
            .create_object_adapter("b", "-w other")
            .await
            .expect("retry");

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_adapter_requires_initialization() {
        let communicator = Communicator::builder()
            .host("127.0.0.1")
            .port(1)
            .build()
            .expect("build");

        let err = communicator
            .create_object_adapter("calc", "-w calc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        assert!(communicator.adapter("calc").is_none());
    }

    #[tokio::test]
    async fn test_generated_endpoint_name() {
        let hub = hub().await;
        let communicator = communicator(&hub).await;

        let adapter = communicator
            .create_object_adapter("anon", "")
            .await
            .expect("adapter");
        assert!(!adapter.endpoint().ws_name().is_empty());
        assert_eq!(adapter.endpoint().port(), hub.port());

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_proxy_argument_called_back() {
        let hub = hub().await;
        let server = communicator(&hub).await;
        let client = communicator(&hub).await;

        // Server: invokes `notify` on whatever listener it is given.
        let server_adapter = server
            .create_object_adapter("subject", "-w subject")
            .await
            .expect("server adapter");
        let subject = Servant::new().with_async_method("subscribe", |args| async move {
            let listener = args.proxy(0)?;
            let reply: String = listener
                .call("notify", vec![Value::from("ping")])
                .await?;
            Ok(reply)
        });
        server_adapter.add(subject, "Subject").expect("subject");

        // Client: serves a listener on its own endpoint.
        let client_adapter = client
            .create_object_adapter("listener", "")
            .await
            .expect("client adapter");
        let listener = Servant::new().with_method("notify", |args| {
            let message: String = args.arg(0)?;
            Ok(format!("{message}-pong"))
        });
        let listener = client_adapter.add(listener, "L").expect("listener");

        let subject = client
            .string_to_proxy("Subject -w subject")
            .await
            .expect("subject proxy");
        let reply: String = subject
            .call("subscribe", vec![Value::from(&listener)])
            .await
            .expect("subscribe");
        assert_eq!(reply, "ping-pong");

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_proxy_result_is_resolved() {
        let hub = hub().await;
        let server = communicator(&hub).await;
        let client = communicator(&hub).await;

        let adapter = server
            .create_object_adapter("factory", "-w factory")
            .await
            .expect("adapter");
        let calc = adapter.add(calculator(), "Calc").expect("calc");
        let factory = Servant::new().with_method("make", move |_| {
            Ok(Value::Map(
                [
                    ("calc".to_string(), Value::from(&calc)),
                    ("label".to_string(), Value::from(json!("main"))),
                ]
                .into_iter()
                .collect(),
            ))
        });
        adapter.add(factory, "Factory").expect("factory");

        let factory = client
            .string_to_proxy("Factory -w factory")
            .await
            .expect("factory proxy");
        let made = factory.invoke("make", Vec::new()).await.expect("make");

        let Value::Map(entries) = made else {
            panic!("expected a map, got {made:?}");
        };
        let calc = entries
            .get("calc")
            .and_then(Value::as_proxy)
            .expect("calc proxy")
            .clone();
        assert!(calc.has_method("add"));

        let sum: i64 = calc.call("add", vec![4.into(), 5.into()]).await.expect("add");
        assert_eq!(sum, 9);

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_own_adapter_reachable_locally() {
        let hub = hub().await;
        let communicator = communicator(&hub).await;

        let adapter = communicator
            .create_object_adapter("calc", "-w calc")
            .await
            .expect("adapter");
        let proxy = adapter.add(calculator(), "X").expect("servant");

        let sum: i64 = proxy.call("add", vec![1.into(), 2.into()]).await.expect("add");
        assert_eq!(sum, 3);

        let resolved = communicator.string_to_proxy("X -w calc").await.expect("resolve");
        assert_eq!(resolved, proxy);

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_lookup_while_adapter_provisions_opens_one_socket() {
        let hub = hub().await;
        let communicator = communicator(&hub).await;
        let endpoint = EndpointInfo::new("calc", "127.0.0.1", hub.port());

        let creating = communicator.create_object_adapter("a", "-w calc");
        let lookup = communicator.inner.factory.get_transceiver(&endpoint);

        creating.await.expect("adapter");
        let lookup = lookup.await.expect("lookup");

        assert_eq!(lookup.role(), Role::Adapter);
        assert!(
            communicator
                .inner
                .factory
                .get("calc")
                .is_some_and(|t| t.ptr_eq(&lookup))
        );
        assert_eq!(hub.peer_count("calc"), 1);

        hub.shutdown();
    }

    #[tokio::test]
    async fn test_endpoint_reusable_after_adapter_lost() {
        let hub = hub().await;
        let server = communicator(&hub).await;
        let client = communicator(&hub).await;

        server
            .create_object_adapter("first", "-w calc")
            .await
            .expect("first adapter");
        let lost = server.inner.factory.get("calc").expect("cached");
        lost.shutdown();
        tokio::time::timeout(Duration::from_secs(2), async {
            while lost.state() != ConnectionState::Lost {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("adapter transceiver lost");

        let second = server
            .create_object_adapter("second", "-w calc")
            .await
            .expect("second adapter");
        second.add(calculator(), "X").expect("servant");

        let proxy = client.string_to_proxy("X -w calc").await.expect("proxy");
        let sum: i64 = proxy.call("add", vec![1.into(), 1.into()]).await.expect("add");
        assert_eq!(sum, 2);

        hub.shutdown();
    }
}
