//! One WebSocket channel and its request/response correlation.
//!
//! A [`Transceiver`] owns the socket to one named endpoint. Calls in both
//! directions share it: outbound requests are correlated with their replies
//! by `request_id`, and inbound invocations are dispatched to the bound
//! object adapter.
//!
//! # Event Loop
//!
//! Each transceiver spawns one tokio task that:
//!
//! - Connects to `ws://host:port/ws_name` and reconnects after a loss
//! - Sends queued and new requests, recording each in the pending table
//! - Routes replies to the promise stored for their `request_id`
//! - Spawns a task per inbound invocation and sends back its reply
//!
//! # States
//!
//! ```text
//! Connecting ──► Open ──► Closed ──► Reconnecting ──► Open ──► …
//!                                         │
//!                                         └── budget exhausted ──► Lost
//! ```
//!
//! Requests issued while not open are queued and flushed on the next open.
//! Calls in flight when the socket closes are rejected with
//! `ConnectionClosedException`; nothing is retried.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::endpoint::EndpointInfo;
use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::promise::{Promise, panic_exception};
use crate::protocol::{
    Args, Incoming, Invocation, ProxyResolver, Reply, Request, Value, contains_reference,
    marshal, marshal_all, unmarshal, unmarshal_all,
};
use crate::proxy::ObjectPrx;

// ============================================================================
// Constants
// ============================================================================

/// Handshake header announcing which side of a channel a peer is.
pub const ROLE_HEADER: &str = "x-wise-role";

/// Reconnection attempts before the transceiver gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;

/// Fixed delay between reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout for a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the event channel.
pub(crate) const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// Map of request ids to the promises awaiting their replies.
type PendingCalls = FxHashMap<RequestId, Promise<Value>>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

/// A request waiting for the socket to open.
type Outbound = (Request, Promise<Value>);

// ============================================================================
// Role
// ============================================================================

/// Which side of a channel a transceiver is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connects to an existing adapter.
    Client,
    /// Serves an object adapter on a provisioned channel.
    Adapter,
}

impl Role {
    /// Returns the handshake header value.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Adapter => "adapter",
        }
    }

    /// Parses a handshake header value.
    #[inline]
    #[must_use]
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "client" => Some(Self::Client),
            "adapter" => Some(Self::Adapter),
            _ => None,
        }
    }
}

// ============================================================================
// TransceiverConfig
// ============================================================================

/// Reconnection policy of a transceiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverConfig {
    /// Reopen the socket after it closes.
    pub reconnect: bool,
    /// Failed reconnection attempts tolerated per outage.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_interval: Duration,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

// ============================================================================
// ConnectionState / TransceiverEvent
// ============================================================================

/// Connection state of a transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Socket open; requests go straight out.
    Open,
    /// Socket closed; a reconnection may follow.
    Closed,
    /// Waiting for or performing a reconnection attempt.
    Reconnecting,
    /// Terminal: retry budget exhausted or shut down.
    Lost,
}

/// Connection notifications broadcast by transceivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransceiverEvent {
    /// The socket opened.
    Opened {
        /// Endpoint name.
        ws_name: String,
        /// `true` if this is not the first open.
        reconnected: bool,
    },
    /// The socket closed.
    Closed {
        /// Endpoint name.
        ws_name: String,
    },
    /// The retry budget ran out; the transceiver will not reconnect.
    ConnectionLost {
        /// Endpoint name.
        ws_name: String,
        /// Reconnection attempts made.
        attempts: u32,
    },
}

// ============================================================================
// InvocationHandler
// ============================================================================

/// Receives invocations arriving on a transceiver.
///
/// Implemented by the object adapter bound to the transceiver.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    /// Executes one invocation and returns its raw result.
    async fn process_request(&self, invocation: Invocation) -> Result<Value>;
}

/// Resolver used when no communicator is attached.
struct Unresolved;

#[async_trait]
impl ProxyResolver for Unresolved {
    async fn resolve_proxy(&self, repr: &str) -> Result<ObjectPrx> {
        Err(Error::protocol(format!("cannot resolve '{repr}' without a communicator")))
    }
}

// ============================================================================
// TransceiverCommand
// ============================================================================

/// Internal commands for the event loop.
enum TransceiverCommand {
    /// Send a request and settle the promise with its reply.
    Send {
        request: Request,
        response: Promise<Value>,
    },
    /// Close the socket and stop reconnecting.
    Shutdown,
}

/// How a socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    /// The socket closed or failed.
    Disconnected,
    /// Shut down on request, or every handle was dropped.
    Stopped,
}

// ============================================================================
// Shared
// ============================================================================

/// Connection state and waiters, guarded together.
struct Status {
    state: ConnectionState,
    waiters: Vec<Promise<()>>,
}

/// State shared between handles and the event loop.
struct Shared {
    endpoint: EndpointInfo,
    role: Role,
    config: TransceiverConfig,
    status: Mutex<Status>,
    pending: Mutex<PendingCalls>,
    handler: RwLock<Option<Weak<dyn InvocationHandler>>>,
    resolver: Weak<dyn ProxyResolver>,
    events: broadcast::Sender<TransceiverEvent>,
}

impl Shared {
    fn ws_name(&self) -> &str {
        self.endpoint.ws_name()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.lock().state = state;
    }

    fn emit(&self, event: TransceiverEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn mark_open(&self, reconnected: bool) {
        let waiters = {
            let mut status = self.status.lock();
            status.state = ConnectionState::Open;
            std::mem::take(&mut status.waiters)
        };

        info!(
            ws_name = %self.ws_name(),
            reconnected,
            waiters = waiters.len(),
            "Transceiver open"
        );

        for waiter in waiters {
            let _ = waiter.resolve(());
        }

        self.emit(TransceiverEvent::Opened {
            ws_name: self.ws_name().to_string(),
            reconnected,
        });
    }

    fn mark_closed(&self) {
        self.set_state(ConnectionState::Closed);

        let in_flight: Vec<_> = self.pending.lock().drain().collect();
        if !in_flight.is_empty() {
            debug!(
                ws_name = %self.ws_name(),
                count = in_flight.len(),
                "Failing in-flight calls on close"
            );
        }
        for (_, promise) in in_flight {
            let _ = promise.reject(Error::connection_closed(self.ws_name()));
        }

        self.emit(TransceiverEvent::Closed {
            ws_name: self.ws_name().to_string(),
        });
    }

    /// Enters the terminal state, rejecting everyone still waiting.
    fn mark_lost(&self, err: &Error, queue: &mut VecDeque<Outbound>) {
        let waiters = {
            let mut status = self.status.lock();
            status.state = ConnectionState::Lost;
            std::mem::take(&mut status.waiters)
        };

        for waiter in waiters {
            let _ = waiter.reject(err);
        }
        for (_, promise) in queue.drain(..) {
            let _ = promise.reject(err);
        }
        for (_, promise) in self.pending.lock().drain() {
            let _ = promise.reject(err);
        }
    }

    fn current_handler(&self) -> Option<Arc<dyn InvocationHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    fn current_resolver(&self) -> Result<Arc<dyn ProxyResolver>> {
        self.resolver
            .upgrade()
            .ok_or_else(|| Error::protocol("object reference received but no communicator is attached"))
    }
}

// ============================================================================
// Transceiver
// ============================================================================

/// Owner of one WebSocket channel.
///
/// Cheap to clone; all clones drive the same socket. The event loop stops
/// when [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct Transceiver {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<TransceiverCommand>,
    /// State shared with the event loop.
    shared: Arc<Shared>,
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transceiver")
            .field("endpoint", &self.shared.endpoint)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transceiver - Constructors
// ============================================================================

impl Transceiver {
    /// Opens a standalone transceiver.
    ///
    /// Object references in inbound messages cannot be resolved without a
    /// communicator; use [`Communicator`](crate::Communicator) for that.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointParse`] if no URL can be built for `endpoint`.
    pub fn open(endpoint: EndpointInfo, role: Role, config: TransceiverConfig) -> Result<Self> {
        let resolver: Weak<dyn ProxyResolver> = Weak::<Unresolved>::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::open_with(endpoint, role, config, resolver, events)
    }

    /// Opens a transceiver reporting to a communicator.
    pub(crate) fn open_with(
        endpoint: EndpointInfo,
        role: Role,
        config: TransceiverConfig,
        resolver: Weak<dyn ProxyResolver>,
        events: broadcast::Sender<TransceiverEvent>,
    ) -> Result<Self> {
        let url = endpoint.ws_url()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            endpoint,
            role,
            config,
            status: Mutex::new(Status {
                state: ConnectionState::Connecting,
                waiters: Vec::new(),
            }),
            pending: Mutex::new(PendingCalls::default()),
            handler: RwLock::new(None),
            resolver,
            events,
        });

        debug!(%url, role = role.as_str(), "Transceiver created");
        tokio::spawn(Self::run_event_loop(Arc::clone(&shared), url, command_rx));

        Ok(Self { command_tx, shared })
    }

    /// Creates a transceiver with no socket behind it.
    #[cfg(test)]
    pub(crate) fn detached(endpoint: EndpointInfo) -> Self {
        let (command_tx, _) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1);
        let resolver: Weak<dyn ProxyResolver> = Weak::<Unresolved>::new();

        Self {
            command_tx,
            shared: Arc::new(Shared {
                endpoint,
                role: Role::Client,
                config: TransceiverConfig::default(),
                status: Mutex::new(Status {
                    state: ConnectionState::Lost,
                    waiters: Vec::new(),
                }),
                pending: Mutex::new(PendingCalls::default()),
                handler: RwLock::new(None),
                resolver,
                events,
            }),
        }
    }
}

// ============================================================================
// Transceiver - Public API
// ============================================================================

impl Transceiver {
    /// Returns the endpoint this transceiver connects to.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &EndpointInfo {
        &self.shared.endpoint
    }

    /// Returns the endpoint name.
    #[inline]
    #[must_use]
    pub fn ws_name(&self) -> &str {
        self.shared.ws_name()
    }

    /// Returns the side of the channel this transceiver is on.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    /// Returns the number of calls awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Returns `true` if both handles drive the same socket.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Subscribes to connection events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransceiverEvent> {
        self.shared.events.subscribe()
    }

    /// Registers `waiter` to be resolved when the socket is open.
    ///
    /// Resolves right away (on a later turn) if already open. Rejects with
    /// `ConnectionLostException` if the transceiver is terminal.
    pub fn notify_when_ready(&self, waiter: Promise<()>) {
        let mut status = self.shared.status.lock();
        match status.state {
            ConnectionState::Open => {
                drop(status);
                let _ = waiter.resolve(());
            }
            ConnectionState::Lost => {
                drop(status);
                let _ = waiter.reject(Error::connection_lost(format!(
                    "endpoint '{}' is no longer reachable",
                    self.ws_name()
                )));
            }
            _ => status.waiters.push(waiter),
        }
    }

    /// Returns a promise resolved when the socket is open.
    #[must_use]
    pub fn ready(&self) -> Promise<()> {
        let waiter = Promise::new();
        self.notify_when_ready(waiter.clone());
        waiter
    }

    /// Sends `request` and settles `response` with its reply.
    ///
    /// The transceiver assigns the request id. If the socket is not open
    /// the request waits in order for the next open.
    pub fn send_request(&self, request: Request, response: Promise<Value>) {
        trace!(
            ws_name = %self.ws_name(),
            identity = %request.identity,
            method = %request.method,
            "Queueing request"
        );

        if let Err(mpsc::error::SendError(command)) =
            self.command_tx.send(TransceiverCommand::Send { request, response })
            && let TransceiverCommand::Send { response, .. } = command
        {
            let _ = response.reject(Error::connection_lost(format!(
                "endpoint '{}' is no longer reachable",
                self.ws_name()
            )));
        }
    }

    /// Invokes `method` on the remote object `identity`.
    #[must_use]
    pub fn invoke(&self, identity: &str, method: &str, params: Vec<Value>) -> Promise<Value> {
        let response = Promise::new();
        let request = Request::new(identity, method, marshal_all(&params));
        self.send_request(request, response.clone());
        response
    }

    /// Closes the socket and stops reconnecting.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(TransceiverCommand::Shutdown);
    }

    /// Routes inbound invocations to `handler`.
    pub(crate) fn bind_handler(&self, handler: Weak<dyn InvocationHandler>) {
        *self.shared.handler.write() = Some(handler);
    }
}

// ============================================================================
// Transceiver - Event Loop
// ============================================================================

impl Transceiver {
    /// Event loop that owns the socket across reconnections.
    async fn run_event_loop(
        shared: Arc<Shared>,
        url: Url,
        mut command_rx: mpsc::UnboundedReceiver<TransceiverCommand>,
    ) {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
        let mut queue: VecDeque<Outbound> = VecDeque::new();
        let mut next_id = RequestId::new(0);
        let mut opened_before = false;
        let mut attempt: u32 = 0;

        loop {
            match Self::connect(&shared, &url).await {
                Ok(ws_stream) => {
                    attempt = 0;
                    shared.mark_open(opened_before);
                    opened_before = true;

                    let exit = Self::run_session(
                        ws_stream,
                        &shared,
                        &mut command_rx,
                        &reply_tx,
                        &mut reply_rx,
                        &mut queue,
                        &mut next_id,
                    )
                    .await;

                    shared.mark_closed();

                    if exit == SessionExit::Stopped {
                        shared.mark_lost(&Error::connection_closed(shared.ws_name()), &mut queue);
                        break;
                    }
                }
                Err(e) => {
                    warn!(ws_name = %shared.ws_name(), attempt, error = %e, "Connection attempt failed");
                }
            }

            if !shared.config.reconnect || attempt >= shared.config.max_attempts {
                error!(
                    ws_name = %shared.ws_name(),
                    attempts = attempt,
                    "Connection lost; giving up"
                );
                let err = Error::connection_lost(format!(
                    "endpoint '{}' unreachable after {attempt} reconnection attempts",
                    shared.ws_name()
                ));
                shared.mark_lost(&err, &mut queue);
                shared.emit(TransceiverEvent::ConnectionLost {
                    ws_name: shared.ws_name().to_string(),
                    attempts: attempt,
                });
                break;
            }

            attempt += 1;
            shared.set_state(ConnectionState::Reconnecting);

            if Self::wait_retry(&shared, &mut command_rx, &mut queue).await == SessionExit::Stopped {
                shared.mark_lost(&Error::connection_closed(shared.ws_name()), &mut queue);
                break;
            }

            debug!(ws_name = %shared.ws_name(), attempt, "Reconnecting");
        }

        // Requests that raced with the final state change.
        command_rx.close();
        while let Ok(command) = command_rx.try_recv() {
            if let TransceiverCommand::Send { response, .. } = command {
                let _ = response.reject(Error::connection_lost(format!(
                    "endpoint '{}' is no longer reachable",
                    shared.ws_name()
                )));
            }
        }

        debug!(ws_name = %shared.ws_name(), "Event loop terminated");
    }

    /// Opens the socket.
    async fn connect(shared: &Shared, url: &Url) -> Result<WsStream> {
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(ROLE_HEADER, HeaderValue::from_static(shared.role.as_str()));

        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| Error::connection(format!("timed out connecting to {url}")))??;

        Ok(ws_stream)
    }

    /// Waits out the retry interval, queueing requests meanwhile.
    async fn wait_retry(
        shared: &Shared,
        command_rx: &mut mpsc::UnboundedReceiver<TransceiverCommand>,
        queue: &mut VecDeque<Outbound>,
    ) -> SessionExit {
        let delay = tokio::time::sleep(shared.config.retry_interval);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                () = &mut delay => return SessionExit::Disconnected,

                command = command_rx.recv() => match command {
                    Some(TransceiverCommand::Send { request, response }) => {
                        queue.push_back((request, response));
                    }
                    Some(TransceiverCommand::Shutdown) | None => return SessionExit::Stopped,
                },
            }
        }
    }

    /// Runs one socket session until it closes or is shut down.
    async fn run_session(
        ws_stream: WsStream,
        shared: &Arc<Shared>,
        command_rx: &mut mpsc::UnboundedReceiver<TransceiverCommand>,
        reply_tx: &mpsc::UnboundedSender<Reply>,
        reply_rx: &mut mpsc::UnboundedReceiver<Reply>,
        queue: &mut VecDeque<Outbound>,
        next_id: &mut RequestId,
    ) -> SessionExit {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        while let Some((request, response)) = queue.pop_front() {
            if Self::write_request(&mut ws_write, shared, request, response, next_id)
                .await
                .is_err()
            {
                return SessionExit::Disconnected;
            }
        }

        loop {
            tokio::select! {
                // Incoming frames from the peer
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_incoming_message(&text, shared, reply_tx);
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!(ws_name = %shared.ws_name(), "WebSocket closed by remote");
                            return SessionExit::Disconnected;
                        }

                        Some(Err(e)) => {
                            warn!(ws_name = %shared.ws_name(), error = %e, "WebSocket error");
                            return SessionExit::Disconnected;
                        }

                        None => {
                            debug!(ws_name = %shared.ws_name(), "WebSocket stream ended");
                            return SessionExit::Disconnected;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Requests from the Rust API
                command = command_rx.recv() => {
                    match command {
                        Some(TransceiverCommand::Send { request, response }) => {
                            if Self::write_request(&mut ws_write, shared, request, response, next_id)
                                .await
                                .is_err()
                            {
                                return SessionExit::Disconnected;
                            }
                        }

                        Some(TransceiverCommand::Shutdown) | None => {
                            debug!(ws_name = %shared.ws_name(), "Shutdown requested");
                            let _ = ws_write.close().await;
                            return SessionExit::Stopped;
                        }
                    }
                }

                // Replies produced by invocation tasks
                Some(reply) = reply_rx.recv() => {
                    if Self::send_response(&mut ws_write, shared, reply).await.is_err() {
                        return SessionExit::Disconnected;
                    }
                }
            }
        }
    }

    /// Assigns an id, records the promise and writes the request.
    async fn write_request(
        ws_write: &mut WsSink,
        shared: &Shared,
        request: Request,
        response: Promise<Value>,
        next_id: &mut RequestId,
    ) -> Result<()> {
        *next_id = next_id.next();
        let request_id = *next_id;
        let request = request.with_id(request_id);

        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                let _ = response.reject(Error::Json(e));
                return Ok(());
            }
        };

        shared.pending.lock().insert(request_id, response);

        ws_write.send(Message::Text(json.into())).await?;

        trace!(
            ws_name = %shared.ws_name(),
            %request_id,
            method = %request.method,
            "Request sent"
        );
        Ok(())
    }

    /// Writes a reply to an invocation received on this socket.
    async fn send_response(ws_write: &mut WsSink, shared: &Shared, reply: Reply) -> Result<()> {
        let request_id = reply.request_id();
        let json = serde_json::to_string(&reply)?;
        ws_write.send(Message::Text(json.into())).await?;

        trace!(ws_name = %shared.ws_name(), %request_id, ok = reply.is_success(), "Reply sent");
        Ok(())
    }

    /// Handles one inbound text frame.
    fn handle_incoming_message(
        text: &str,
        shared: &Arc<Shared>,
        reply_tx: &mpsc::UnboundedSender<Reply>,
    ) {
        match Incoming::parse(text) {
            Ok(Incoming::Invocation(request)) => {
                tokio::spawn(Self::dispatch_invocation(
                    Arc::clone(shared),
                    request,
                    reply_tx.clone(),
                ));
            }

            Ok(Incoming::Reply(reply)) => Self::handle_reply(shared, reply),

            Err(e) => {
                error!(ws_name = %shared.ws_name(), error = %e, text = %text, "Protocol fault; message dropped");
            }
        }
    }

    /// Settles the promise waiting for `reply`.
    fn handle_reply(shared: &Arc<Shared>, reply: Reply) {
        let request_id = reply.request_id();
        let Some(response) = shared.pending.lock().remove(&request_id) else {
            debug!(ws_name = %shared.ws_name(), %request_id, "Reply for unknown request ignored");
            return;
        };

        match reply.into_outcome() {
            Ok(result) if contains_reference(&result) => {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    let decoded = match shared.current_resolver() {
                        Ok(resolver) => unmarshal(result, resolver.as_ref()).await,
                        Err(e) => Err(e),
                    };
                    let _ = match decoded {
                        Ok(value) => response.resolve(value),
                        Err(e) => response.reject(e),
                    };
                });
            }
            Ok(result) => {
                let _ = response.resolve(Value::Data(result));
            }
            Err(exception) => {
                let _ = response.reject(exception);
            }
        }
    }

    /// Runs an inbound invocation and queues its reply.
    ///
    /// Every failure, including a panic in servant code, becomes an error
    /// reply; the transceiver keeps running.
    async fn dispatch_invocation(
        shared: Arc<Shared>,
        request: Request,
        reply_tx: mpsc::UnboundedSender<Reply>,
    ) {
        let request_id = request.request_id;
        let identity = request.identity.clone();
        let method = request.method.clone();

        let outcome = AssertUnwindSafe(Self::invoke_local(&shared, request))
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok(value)) => Reply::success(request_id, marshal(&value)),
            Ok(Err(e)) => {
                debug!(%identity, %method, error = %e, "Invocation failed");
                Reply::failure(request_id, e.to_exception())
            }
            Err(panic) => {
                let exception = panic_exception(panic.as_ref());
                error!(%identity, %method, message = %exception.message, "Servant panicked");
                Reply::failure(request_id, exception)
            }
        };

        if reply_tx.send(reply).is_err() {
            debug!(%identity, %method, "Transceiver stopped; reply dropped");
        }
    }

    async fn invoke_local(shared: &Shared, request: Request) -> Result<Value> {
        let handler = shared
            .current_handler()
            .ok_or_else(|| Error::object_not_exist(&request.identity))?;

        let args = if request.params.iter().any(contains_reference) {
            let resolver = shared.current_resolver()?;
            unmarshal_all(request.params, resolver.as_ref()).await?
        } else {
            request.params.into_iter().map(Value::Data).collect::<Args>()
        };

        handler
            .process_request(Invocation {
                identity: request.identity,
                method: request.method,
                args,
            })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value as JsonValue, json};
    use tokio::net::TcpListener;

    type ServerStream = WebSocketStream<TcpStream>;

    async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    async fn accept(listener: &TcpListener) -> ServerStream {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_async(stream).await.expect("handshake")
    }

    async fn next_json(ws: &mut ServerStream) -> JsonValue {
        loop {
            match ws.next().await.expect("frame").expect("read") {
                Message::Text(text) => return serde_json::from_str(&text).expect("json"),
                _ => continue,
            }
        }
    }

    async fn send_json(ws: &mut ServerStream, value: JsonValue) {
        ws.send(Message::Text(value.to_string().into()))
            .await
            .expect("send");
    }

    async fn send_text(ws: &mut ServerStream, text: &str) {
        ws.send(Message::Text(text.to_string().into()))
            .await
            .expect("send");
    }

    fn quick_config() -> TransceiverConfig {
        TransceiverConfig {
            reconnect: true,
            max_attempts: 3,
            retry_interval: Duration::from_millis(200),
        }
    }

    fn open_client(port: u16, config: TransceiverConfig) -> Transceiver {
        let endpoint = EndpointInfo::new("calc", "127.0.0.1", port);
        Transceiver::open(endpoint, Role::Client, config).expect("open")
    }

    struct Summer;

    #[async_trait]
    impl InvocationHandler for Summer {
        async fn process_request(&self, invocation: Invocation) -> Result<Value> {
            match invocation.method.as_str() {
                "add" => {
                    let a: i64 = invocation.args.arg(0)?;
                    let b: i64 = invocation.args.arg(1)?;
                    Ok(Value::from(a + b))
                }
                "explode" => panic!("servant blew up"),
                other => Err(Error::operation_not_exist(&invocation.identity, other)),
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = TransceiverConfig::default();
        assert!(config.reconnect);
        assert_eq!(config.max_attempts, 15);
        assert_eq!(config.retry_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_role_header_round_trip() {
        assert_eq!(Role::from_header(Role::Adapter.as_str()), Some(Role::Adapter));
        assert_eq!(Role::from_header(Role::Client.as_str()), Some(Role::Client));
        assert_eq!(Role::from_header("other"), None);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());

        let first = transceiver.invoke("calc", "slow", vec![Value::from(1)]);
        let second = transceiver.invoke("calc", "fast", vec![Value::from(2)]);

        let mut ws = accept(&listener).await;
        let req_a = next_json(&mut ws).await;
        let req_b = next_json(&mut ws).await;
        assert_eq!(req_a["method"], "slow");
        assert_eq!(req_b["method"], "fast");
        assert!(req_a["request_id"].as_u64() < req_b["request_id"].as_u64());

        send_json(&mut ws, json!({"request_id": req_b["request_id"], "result": "b"})).await;
        send_json(&mut ws, json!({"request_id": req_a["request_id"], "result": "a"})).await;

        assert_eq!(second.await.expect("second"), Value::from("b"));
        assert_eq!(first.await.expect("first"), Value::from("a"));
        assert_eq!(transceiver.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_rejects() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let call = transceiver.invoke("ghost", "boo", vec![]);

        let mut ws = accept(&listener).await;
        let request = next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"request_id": request["request_id"], "error": ["ObjectNotExistException", "no ghost"]}),
        )
        .await;

        let err = call.await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotExist { ref message } if message == "no ghost"));
    }

    #[tokio::test]
    async fn test_unknown_reply_and_garbage_are_ignored() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let call = transceiver.invoke("calc", "add", vec![]);

        let mut ws = accept(&listener).await;
        let request = next_json(&mut ws).await;

        send_json(&mut ws, json!({"request_id": 999, "result": "late"})).await;
        send_text(&mut ws, "not json at all").await;
        send_json(&mut ws, json!({"request_id": 1000})).await;
        send_json(&mut ws, json!({"request_id": request["request_id"], "result": 5})).await;

        assert_eq!(call.await.expect("reply"), Value::from(5));
        assert_eq!(transceiver.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_inbound_invocation_dispatch() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let handler: Arc<dyn InvocationHandler> = Arc::new(Summer);
        transceiver.bind_handler(Arc::downgrade(&handler));

        let mut ws = accept(&listener).await;

        send_json(
            &mut ws,
            json!({"request_id": 10, "identity": "calc", "method": "add", "params": [2, 3]}),
        )
        .await;
        assert_eq!(next_json(&mut ws).await, json!({"request_id": 10, "result": 5}));

        send_json(
            &mut ws,
            json!({"request_id": 11, "identity": "calc", "method": "mul", "params": []}),
        )
        .await;
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["request_id"], 11);
        assert_eq!(reply["error"][0], "OperationNotExistException");

        send_json(
            &mut ws,
            json!({"request_id": 12, "identity": "calc", "method": "explode", "params": []}),
        )
        .await;
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["error"][0], "UnknownLocalException");
        assert_eq!(reply["error"][1], "servant blew up");

        // Still serving after the panic.
        send_json(
            &mut ws,
            json!({"request_id": 13, "identity": "calc", "method": "add", "params": [1, 1]}),
        )
        .await;
        assert_eq!(next_json(&mut ws).await, json!({"request_id": 13, "result": 2}));
    }

    #[tokio::test]
    async fn test_invocation_without_adapter() {
        let (listener, port) = listen().await;
        let _transceiver = open_client(port, quick_config());
        let mut ws = accept(&listener).await;

        send_json(
            &mut ws,
            json!({"request_id": 1, "identity": "calc", "method": "add", "params": []}),
        )
        .await;
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["error"][0], "ObjectNotExistException");
    }

    #[tokio::test]
    async fn test_reference_without_communicator_is_rejected() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let call = transceiver.invoke("calc", "owner", vec![]);

        let mut ws = accept(&listener).await;
        let request = next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({
                "request_id": request["request_id"],
                "result": {"wise_typecode": "Proxy", "repr": "X -w other -h 127.0.0.1 -p 1"}
            }),
        )
        .await;

        let err = call.await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_role_header_sent() {
        let (listener, port) = listen().await;
        let endpoint = EndpointInfo::new("calc", "127.0.0.1", port);
        let _transceiver = Transceiver::open(endpoint, Role::Adapter, quick_config()).expect("open");

        let (stream, _) = listener.accept().await.expect("accept");
        let mut role = None;
        let mut path = None;
        let _ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
             resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
                path = Some(req.uri().path().to_string());
                role = req
                    .headers()
                    .get(ROLE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            },
        )
        .await
        .expect("handshake");

        assert_eq!(path.as_deref(), Some("/calc"));
        assert_eq!(role.as_deref(), Some("adapter"));
    }

    #[tokio::test]
    async fn test_reconnect_fires_waiters_once() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let mut events = transceiver.subscribe();

        let mut first = accept(&listener).await;
        transceiver.ready().await.expect("first open");

        first.close(None).await.expect("close");
        drop(first);

        loop {
            match events.recv().await.expect("event") {
                TransceiverEvent::Closed { .. } => break,
                _ => continue,
            }
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let fired = Arc::clone(&fired);
                transceiver.ready().map(move |()| {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let closed_at = tokio::time::Instant::now();
        let _second = accept(&listener).await;
        for waiter in waiters {
            waiter.await.expect("reopened");
        }
        assert!(closed_at.elapsed() >= Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let reopened = timeout(Duration::from_millis(600), listener.accept()).await;
        assert!(reopened.is_err(), "a second reconnection was attempted");
        assert_eq!(transceiver.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_in_flight_calls_fail_on_close() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let call = transceiver.invoke("calc", "add", vec![]);

        let mut ws = accept(&listener).await;
        let _request = next_json(&mut ws).await;
        ws.close(None).await.expect("close");

        let err = call.await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_terminal() {
        let (listener, port) = listen().await;
        drop(listener);

        let config = TransceiverConfig {
            reconnect: true,
            max_attempts: 2,
            retry_interval: Duration::from_millis(20),
        };
        let transceiver = open_client(port, config);
        let mut events = transceiver.subscribe();
        let queued = transceiver.invoke("calc", "add", vec![]);

        let err = transceiver.ready().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert!(matches!(queued.await, Err(Error::ConnectionLost { .. })));
        assert_eq!(transceiver.state(), ConnectionState::Lost);

        let lost = loop {
            if let TransceiverEvent::ConnectionLost { attempts, .. } =
                events.recv().await.expect("event")
            {
                break attempts;
            }
        };
        assert_eq!(lost, 2);

        let late = transceiver.invoke("calc", "add", vec![]).await.unwrap_err();
        assert!(late.is_connection_error());
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnecting() {
        let (listener, port) = listen().await;
        let transceiver = open_client(port, quick_config());
        let mut ws = accept(&listener).await;
        transceiver.ready().await.expect("open");

        transceiver.shutdown();
        assert!(matches!(ws.next().await, Some(Ok(Message::Close(_))) | None));

        let reopened = timeout(Duration::from_millis(500), listener.accept()).await;
        assert!(reopened.is_err());
        assert!(transceiver.ready().await.is_err());
    }
}
