//! One named channel on the hub and its request routing.
//!
//! Every channel has at most one owner. The owner is either an adapter
//! peer or, for the admin channel, a local servant registry. Invocations
//! from any peer go to the owner under a hub-assigned id; the owner's
//! replies are mapped back to the originating peer and its own id.
//!
//! ```text
//! client A ── {id: 1} ──►┐                 ┌──► {id: 7} ──► owner
//! client B ── {id: 1} ──►┤  route table    ├──► {id: 8} ──► owner
//!                        │  7 → (A, 1)     │
//! client A ◄─ {id: 1} ───┤  8 → (B, 1)     ├◄── {id: 7} ─── owner
//! ```

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::adapter::ServantRegistry;
use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::{Incoming, Invocation, Reply, Request, Value, marshal};
use crate::transport::Role;

// ============================================================================
// Types
// ============================================================================

/// Hub-wide peer number.
pub(crate) type PeerId = u64;

/// Frames queued for one peer's socket.
pub(crate) type Outbox = mpsc::UnboundedSender<Message>;

/// Who answers invocations on a channel.
enum Owner {
    /// Served in-process.
    Local(ServantRegistry),
    /// Served by a connected adapter peer.
    Peer(PeerId),
    /// Provisioned, but no adapter is connected.
    Vacant,
}

/// Where to deliver the reply to a forwarded invocation.
#[derive(Debug, Clone, Copy)]
struct Route {
    origin: PeerId,
    request_id: RequestId,
}

struct ChannelState {
    owner: Owner,
    peers: FxHashMap<PeerId, Outbox>,
    routes: FxHashMap<RequestId, Route>,
    next_id: RequestId,
}

// ============================================================================
// Channel
// ============================================================================

/// A named channel and its connected peers.
pub(crate) struct Channel {
    name: String,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Creates a channel awaiting its adapter.
    pub(crate) fn vacant(name: impl Into<String>) -> Self {
        Self::with_owner(name, Owner::Vacant)
    }

    /// Creates a channel served by `registry`.
    pub(crate) fn local(name: impl Into<String>, registry: ServantRegistry) -> Self {
        Self::with_owner(name, Owner::Local(registry))
    }

    fn with_owner(name: impl Into<String>, owner: Owner) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ChannelState {
                owner,
                peers: FxHashMap::default(),
                routes: FxHashMap::default(),
                next_id: RequestId::new(0),
            }),
        }
    }

    /// Returns the channel name.
    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of connected peers.
    pub(crate) fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Connects a peer; an adapter peer becomes the owner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyUsedEndpoint`] if an adapter peer arrives
    /// while the channel already has an owner.
    pub(crate) fn attach(&self, peer: PeerId, role: Role, outbox: Outbox) -> Result<()> {
        let mut state = self.state.lock();

        if role == Role::Adapter {
            if !matches!(state.owner, Owner::Vacant) {
                return Err(Error::already_used_endpoint(&self.name));
            }
            state.owner = Owner::Peer(peer);
        }

        state.peers.insert(peer, outbox);
        debug!(channel = %self.name, peer, role = role.as_str(), "Peer attached");
        Ok(())
    }

    /// Disconnects a peer.
    ///
    /// If the owner leaves, every forwarded call still awaiting a reply is
    /// answered with `ConnectionClosedException`.
    pub(crate) fn detach(&self, peer: PeerId) {
        let mut state = self.state.lock();
        state.peers.remove(&peer);

        if matches!(state.owner, Owner::Peer(owner) if owner == peer) {
            state.owner = Owner::Vacant;
            let exception = Error::connection_closed(&self.name).to_exception();
            let routes: Vec<_> = state.routes.drain().map(|(_, route)| route).collect();

            debug!(channel = %self.name, failed = routes.len(), "Owner detached");

            for route in routes {
                if let Some(outbox) = state.peers.get(&route.origin) {
                    send(outbox, &Reply::failure(route.request_id, exception.clone()));
                }
            }
        } else {
            state.routes.retain(|_, route| route.origin != peer);
            debug!(channel = %self.name, peer, "Peer detached");
        }
    }

    /// Closes every peer socket.
    pub(crate) fn close_all(&self) {
        let mut state = self.state.lock();
        for outbox in state.peers.values() {
            let _ = outbox.send(Message::Close(None));
        }
        state.peers.clear();
        state.routes.clear();
        if matches!(state.owner, Owner::Peer(_)) {
            state.owner = Owner::Vacant;
        }
    }

    /// Routes one text frame received from `peer`.
    pub(crate) fn handle_frame(&self, peer: PeerId, text: &str) {
        match Incoming::parse(text) {
            Ok(Incoming::Invocation(request)) => self.route_invocation(peer, request),
            Ok(Incoming::Reply(reply)) => self.route_reply(peer, reply),
            Err(e) => {
                warn!(channel = %self.name, peer, error = %e, "Protocol fault; frame dropped");
            }
        }
    }

    fn route_invocation(&self, peer: PeerId, request: Request) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(origin) = state.peers.get(&peer).cloned() else {
            return;
        };

        match &state.owner {
            Owner::Peer(owner) => {
                let owner = *owner;
                state.next_id = state.next_id.next();
                let hub_id = state.next_id;
                state.routes.insert(
                    hub_id,
                    Route {
                        origin: peer,
                        request_id: request.request_id,
                    },
                );

                trace!(channel = %self.name, peer, %hub_id, method = %request.method, "Forwarding");
                if let Some(outbox) = state.peers.get(&owner) {
                    send(outbox, &request.with_id(hub_id));
                }
            }

            Owner::Local(registry) => {
                tokio::spawn(dispatch_local(registry.clone(), request, origin));
            }

            Owner::Vacant => {
                let exception = Error::connection_closed(&self.name).to_exception();
                send(&origin, &Reply::failure(request.request_id, exception));
            }
        }
    }

    fn route_reply(&self, peer: PeerId, reply: Reply) {
        let mut state = self.state.lock();

        if !matches!(state.owner, Owner::Peer(owner) if owner == peer) {
            debug!(channel = %self.name, peer, "Reply from non-owner dropped");
            return;
        }

        let Some(route) = state.routes.remove(&reply.request_id()) else {
            debug!(channel = %self.name, request_id = %reply.request_id(), "Reply for unknown request dropped");
            return;
        };

        if let Some(outbox) = state.peers.get(&route.origin) {
            send(outbox, &reply.with_request_id(route.request_id));
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Runs an invocation against an in-process registry.
async fn dispatch_local(registry: ServantRegistry, request: Request, origin: Outbox) {
    let request_id = request.request_id;
    let invocation = Invocation::new(
        request.identity,
        request.method,
        request.params.into_iter().map(Value::Data).collect::<Vec<_>>(),
    );

    let reply = match registry.process_request(invocation).await {
        Ok(value) => Reply::success(request_id, marshal(&value)),
        Err(e) => Reply::failure(request_id, e.to_exception()),
    };
    send(&origin, &reply);
}

/// Queues a JSON frame for a peer.
fn send(outbox: &Outbox, payload: &impl Serialize) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if outbox.send(Message::Text(json.into())).is_err() {
                debug!("Peer gone; frame dropped");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode frame"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value as JsonValue, json};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::adapter::Servant;

    fn peer() -> (Outbox, UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn frame(rx: &mut UnboundedReceiver<Message>) -> JsonValue {
        match rx.try_recv().expect("frame queued") {
            Message::Text(text) => serde_json::from_str(&text).expect("json"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_ids_rewritten_per_client() {
        let channel = Channel::vacant("calc");
        let (owner_tx, mut owner_rx) = peer();
        let (a_tx, mut a_rx) = peer();
        let (b_tx, mut b_rx) = peer();
        channel.attach(1, Role::Adapter, owner_tx).expect("owner");
        channel.attach(2, Role::Client, a_tx).expect("a");
        channel.attach(3, Role::Client, b_tx).expect("b");

        let call = json!({"request_id": 1, "identity": "X", "method": "add", "params": []});
        channel.handle_frame(2, &call.to_string());
        channel.handle_frame(3, &call.to_string());

        let first = frame(&mut owner_rx);
        let second = frame(&mut owner_rx);
        assert_ne!(first["request_id"], second["request_id"]);

        // Answer in reverse order.
        let reply = json!({"request_id": second["request_id"], "result": "for b"});
        channel.handle_frame(1, &reply.to_string());
        let reply = json!({"request_id": first["request_id"], "result": "for a"});
        channel.handle_frame(1, &reply.to_string());

        assert_eq!(frame(&mut a_rx), json!({"request_id": 1, "result": "for a"}));
        assert_eq!(frame(&mut b_rx), json!({"request_id": 1, "result": "for b"}));
    }

    #[test]
    fn test_second_adapter_rejected() {
        let channel = Channel::vacant("calc");
        let (first, _first_rx) = peer();
        let (second, _second_rx) = peer();

        channel.attach(1, Role::Adapter, first).expect("first");
        assert!(matches!(
            channel.attach(2, Role::Adapter, second),
            Err(Error::AlreadyUsedEndpoint { .. })
        ));
        assert_eq!(channel.peer_count(), 1);

        let (client, _client_rx) = peer();
        channel.attach(3, Role::Client, client).expect("client");
    }

    #[test]
    fn test_owner_leaving_fails_pending_calls() {
        let channel = Channel::vacant("calc");
        let (owner_tx, _owner_rx) = peer();
        let (client_tx, mut client_rx) = peer();
        channel.attach(1, Role::Adapter, owner_tx).expect("owner");
        channel.attach(2, Role::Client, client_tx).expect("client");

        let call = json!({"request_id": 5, "identity": "X", "method": "add", "params": []});
        channel.handle_frame(2, &call.to_string());
        channel.detach(1);

        let reply = frame(&mut client_rx);
        assert_eq!(reply["request_id"], 5);
        assert_eq!(reply["error"][0], "ConnectionClosedException");

        // A new adapter may take over.
        let (next_tx, _next_rx) = peer();
        channel.attach(3, Role::Adapter, next_tx).expect("new owner");
    }

    #[test]
    fn test_vacant_channel_answers_closed() {
        let channel = Channel::vacant("calc");
        let (client_tx, mut client_rx) = peer();
        channel.attach(2, Role::Client, client_tx).expect("client");

        let call = json!({"request_id": 9, "identity": "X", "method": "add", "params": []});
        channel.handle_frame(2, &call.to_string());

        assert_eq!(frame(&mut client_rx)["error"][0], "ConnectionClosedException");
    }

    #[test]
    fn test_owner_may_call_itself() {
        let channel = Channel::vacant("calc");
        let (owner_tx, mut owner_rx) = peer();
        channel.attach(1, Role::Adapter, owner_tx).expect("owner");

        let call = json!({"request_id": 3, "identity": "X", "method": "add", "params": []});
        channel.handle_frame(1, &call.to_string());
        let forwarded = frame(&mut owner_rx);
        assert_eq!(forwarded["method"], "add");

        let reply = json!({"request_id": forwarded["request_id"], "result": 1});
        channel.handle_frame(1, &reply.to_string());
        assert_eq!(frame(&mut owner_rx), json!({"request_id": 3, "result": 1}));
    }

    #[test]
    fn test_garbage_and_stray_replies_dropped() {
        let channel = Channel::vacant("calc");
        let (owner_tx, mut owner_rx) = peer();
        let (client_tx, mut client_rx) = peer();
        channel.attach(1, Role::Adapter, owner_tx).expect("owner");
        channel.attach(2, Role::Client, client_tx).expect("client");

        channel.handle_frame(2, "{{{");
        channel.handle_frame(2, &json!({"request_id": 1, "result": 0}).to_string());
        channel.handle_frame(1, &json!({"request_id": 77, "result": 0}).to_string());

        assert!(owner_rx.try_recv().is_err());
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_owner_dispatches() {
        let registry = ServantRegistry::new();
        registry
            .add(
                Servant::new().with_method("echo", |args| Ok(args.value(0)?.clone())),
                "Echo",
            )
            .expect("add");
        let channel = Channel::local("admin", registry);
        let (client_tx, mut client_rx) = peer();
        channel.attach(1, Role::Client, client_tx).expect("client");

        let call = json!({"request_id": 4, "identity": "Echo", "method": "echo", "params": ["hi"]});
        channel.handle_frame(1, &call.to_string());

        let Some(Message::Text(text)) = client_rx.recv().await else {
            panic!("expected reply");
        };
        let reply: JsonValue = serde_json::from_str(&text).expect("json");
        assert_eq!(reply, json!({"request_id": 4, "result": "hi"}));
    }
}
