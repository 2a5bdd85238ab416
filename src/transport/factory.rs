//! Transceiver registry keyed by endpoint name.
//!
//! Every proxy and adapter reaching the same `ws_name` shares one
//! [`Transceiver`], so there is at most one socket per endpoint name.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            TransceiverFactory            │
//! │  ┌────────────────────────────────────┐  │
//! │  │ "calc"      → Transceiver (client) │  │
//! │  │ "WiseAdmin" → Transceiver (client) │  │
//! │  │ "a1b2…"     → Transceiver (adapter)│  │
//! │  └────────────────────────────────────┘  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Client transceivers connect to channels that already exist. Adapter
//! transceivers first ask the hub's admin object to provision the channel,
//! then connect as its owner. A lookup of a name that is still being
//! provisioned waits for the adapter transceiver instead of opening its own.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::endpoint::EndpointInfo;
use crate::error::{Error, Result};
use crate::promise::{Promise, Settle};
use crate::protocol::{CREATE_SOCKET_METHOD, ProxyResolver, Value};
use crate::proxy::ObjectPrx;

use super::transceiver::{
    ConnectionState, EVENT_CAPACITY, Role, Transceiver, TransceiverConfig, TransceiverEvent,
};

// ============================================================================
// TransceiverFactory
// ============================================================================

/// Registry of transceivers by endpoint name.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct TransceiverFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    /// Reconnection policy for new transceivers.
    config: TransceiverConfig,

    /// Live transceivers by `ws_name`.
    transceivers: RwLock<FxHashMap<String, Transceiver>>,

    /// Adapter transceivers still being provisioned, by `ws_name`.
    provisioning: Mutex<FxHashMap<String, Promise<Transceiver>>>,

    /// Resolves object references arriving on any transceiver.
    resolver: Weak<dyn ProxyResolver>,

    /// Connection events of every transceiver.
    events: broadcast::Sender<TransceiverEvent>,
}

// ============================================================================
// TransceiverFactory - Constructor
// ============================================================================

impl TransceiverFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new(config: TransceiverConfig, resolver: Weak<dyn ProxyResolver>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(FactoryInner {
                config,
                transceivers: RwLock::new(FxHashMap::default()),
                provisioning: Mutex::new(FxHashMap::default()),
                resolver,
                events,
            }),
        }
    }
}

// ============================================================================
// TransceiverFactory - Public API
// ============================================================================

impl TransceiverFactory {
    /// Returns the reconnection policy.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &TransceiverConfig {
        &self.inner.config
    }

    /// Returns the number of cached transceivers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.transceivers.read().len()
    }

    /// Returns `true` if no transceiver is cached.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.transceivers.read().is_empty()
    }

    /// Returns the cached transceiver for `ws_name`.
    #[must_use]
    pub fn get(&self, ws_name: &str) -> Option<Transceiver> {
        self.inner.transceivers.read().get(ws_name).cloned()
    }

    /// Subscribes to connection events of every transceiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransceiverEvent> {
        self.inner.events.subscribe()
    }

    /// Returns a connected client transceiver for `endpoint`.
    ///
    /// Concurrent calls for the same name share one socket and one
    /// connection attempt. A transceiver that was terminally lost is
    /// replaced by a fresh one. While the name is being provisioned the
    /// call follows the adapter transceiver, falling back to a client
    /// socket only if provisioning fails.
    #[must_use]
    pub fn get_transceiver(&self, endpoint: &EndpointInfo) -> Promise<Transceiver> {
        let transceiver = {
            let mut transceivers = self.inner.transceivers.write();

            match transceivers.get(endpoint.ws_name()) {
                Some(existing) if existing.state() != ConnectionState::Lost => existing.clone(),
                _ => {
                    let provisioning = self.inner.provisioning.lock().get(endpoint.ws_name()).cloned();
                    if let Some(pending) = provisioning {
                        debug!(ws_name = %endpoint.ws_name(), "Waiting for channel provisioning");
                        return self.after_provisioning(endpoint, &pending);
                    }

                    match self.open(endpoint, Role::Client) {
                        Ok(created) => {
                            debug!(ws_name = %endpoint.ws_name(), "Transceiver cached");
                            transceivers.insert(endpoint.ws_name().to_string(), created.clone());
                            created
                        }
                        Err(e) => return Promise::rejected(e),
                    }
                }
            }
        };

        Self::when_ready(transceiver)
    }

    /// Provisions a channel for `endpoint` and connects to it as its owner.
    ///
    /// `admin` is the hub's admin object; its `create_socket` call must
    /// succeed before the socket is opened. A cached adapter transceiver
    /// that was lost already owns a provisioned channel, so it is replaced
    /// without asking the admin again.
    ///
    /// Rejects with `AlreadyUsedEndpoint` if a live transceiver for the
    /// name exists or the name is being provisioned.
    #[must_use]
    pub fn create_transceiver(&self, endpoint: &EndpointInfo, admin: &ObjectPrx) -> Promise<Transceiver> {
        let ws_name = endpoint.ws_name().to_string();
        let created = Promise::new();

        let reattach = {
            let mut transceivers = self.inner.transceivers.write();
            let mut provisioning = self.inner.provisioning.lock();

            if provisioning.contains_key(&ws_name) {
                return Promise::rejected(Error::already_used_endpoint(&ws_name));
            }

            let reattach = match transceivers.get(&ws_name) {
                Some(existing) if existing.state() != ConnectionState::Lost => {
                    return Promise::rejected(Error::already_used_endpoint(&ws_name));
                }
                Some(lost) => {
                    let owned = lost.role() == Role::Adapter;
                    transceivers.remove(&ws_name);
                    owned
                }
                None => false,
            };

            provisioning.insert(ws_name.clone(), created.clone());
            reattach
        };

        let provisioned = if reattach {
            debug!(%ws_name, "Reattaching to provisioned channel");
            Promise::resolved(Value::null())
        } else {
            debug!(%ws_name, "Provisioning channel");
            admin.invoke(CREATE_SOCKET_METHOD, vec![Value::from(ws_name.as_str())])
        };

        let factory = self.clone();
        let endpoint = endpoint.clone();
        let outcome = provisioned.then_or(
            move |_| {
                let settle = factory.attach_adapter(&endpoint);
                factory.inner.provisioning.lock().remove(endpoint.ws_name());
                settle
            },
            {
                let factory = self.clone();
                move |exception| {
                    factory.inner.provisioning.lock().remove(&ws_name);
                    Settle::Reject(exception)
                }
            },
        );

        // Fresh and pending, so adoption cannot fail.
        let _ = created.adopt(&outcome);
        created
    }

    /// Shuts down every cached transceiver.
    pub fn shutdown(&self) {
        let transceivers: Vec<_> = self.inner.transceivers.write().drain().map(|(_, t)| t).collect();
        for transceiver in transceivers {
            transceiver.shutdown();
        }
    }
}

// ============================================================================
// TransceiverFactory - Internal
// ============================================================================

impl TransceiverFactory {
    fn open(&self, endpoint: &EndpointInfo, role: Role) -> Result<Transceiver> {
        Transceiver::open_with(
            endpoint.clone(),
            role,
            self.inner.config.clone(),
            self.inner.resolver.clone(),
            self.inner.events.clone(),
        )
    }

    /// Opens the adapter transceiver of a provisioned channel and caches it.
    fn attach_adapter(&self, endpoint: &EndpointInfo) -> Settle<Transceiver> {
        let mut transceivers = self.inner.transceivers.write();

        if transceivers
            .get(endpoint.ws_name())
            .is_some_and(|existing| existing.state() != ConnectionState::Lost)
        {
            return Settle::error(&Error::already_used_endpoint(endpoint.ws_name()));
        }

        match self.open(endpoint, Role::Adapter) {
            Ok(transceiver) => {
                transceivers.insert(endpoint.ws_name().to_string(), transceiver.clone());
                info!(ws_name = %endpoint.ws_name(), "Channel provisioned");
                Settle::Adopt(Self::when_ready(transceiver))
            }
            Err(e) => Settle::error(&e),
        }
    }

    /// Follows a provisioning in flight, connecting as a client if it fails.
    fn after_provisioning(&self, endpoint: &EndpointInfo, pending: &Promise<Transceiver>) -> Promise<Transceiver> {
        let factory = self.clone();
        let endpoint = endpoint.clone();
        pending.then_or(Settle::Fulfill, move |exception| {
            debug!(ws_name = %endpoint.ws_name(), error = %exception.message, "Provisioning failed; connecting as client");
            Settle::Adopt(factory.get_transceiver(&endpoint))
        })
    }

    fn when_ready(transceiver: Transceiver) -> Promise<Transceiver> {
        transceiver.ready().map(move |()| transceiver)
    }
}

// ============================================================================
// Tests
// ============================================================================
