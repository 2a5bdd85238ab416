//! In-process WebSocket hub relaying calls between peers.
//!
//! Peers connect to `ws://host:port/<ws_name>`. Each name is a channel that
//! must be provisioned first through the admin object on the `WiseAdmin`
//! channel. The first peer announcing the adapter role (handshake header
//! `x-wise-role: adapter`) owns the channel; every other peer is a client
//! whose invocations are relayed to the owner.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                    Hub                     │
//! │               (single port)                │
//! │  ┌──────────────────────────────────────┐  │
//! │  │ /WiseAdmin → admin servant (local)   │  │
//! │  │ /calc      → owner + clients         │  │
//! │  │ /a1b2…     → owner + clients         │  │
//! │  └──────────────────────────────────────┘  │
//! └────────────────────────────────────────────┘
//! ```
//!
//! # Handshake Outcomes
//!
//! | Situation | Response |
//! |-----------|----------|
//! | Channel not provisioned | `404 Not Found` |
//! | Adapter on an owned channel | `409 Conflict` |
//! | Undecodable path | `400 Bad Request` |
//! | Otherwise | Upgrade |

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::adapter::ServantRegistry;
use crate::error::{Error, Result};
use crate::protocol::{ADMIN_IDENTITY, ADMIN_WS_NAME};
use crate::transport::{ROLE_HEADER, Role};

use self::channel::{Channel, Outbox, PeerId};

// ============================================================================
// Submodules
// ============================================================================

/// Provisioning servant.
mod admin;

/// Channel routing.
mod channel;

// ============================================================================
// Constants
// ============================================================================

/// Interval at which the accept loop checks for shutdown.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// HubInner
// ============================================================================

/// State shared between the hub handle, the accept loop and the admin
/// servant.
pub(crate) struct HubInner {
    /// Channels by name.
    channels: RwLock<FxHashMap<String, Arc<Channel>>>,

    /// Next peer number.
    next_peer: AtomicU64,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

impl HubInner {
    fn new() -> Self {
        Self {
            channels: RwLock::new(FxHashMap::default()),
            next_peer: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    /// Provisions a channel.
    pub(crate) fn create_channel(&self, ws_name: &str) -> Result<()> {
        if ws_name.is_empty() || ws_name.contains('/') {
            return Err(Error::invalid_argument(format!(
                "invalid channel name '{ws_name}'"
            )));
        }

        let mut channels = self.channels.write();
        if channels.contains_key(ws_name) {
            return Err(Error::already_used_endpoint(ws_name));
        }
        channels.insert(ws_name.to_string(), Arc::new(Channel::vacant(ws_name)));

        info!(%ws_name, "Channel provisioned");
        Ok(())
    }

    /// Removes a channel and closes its peers.
    pub(crate) fn remove_channel(&self, ws_name: &str) -> bool {
        if ws_name == ADMIN_WS_NAME {
            return false;
        }

        let removed = self.channels.write().remove(ws_name);
        match removed {
            Some(channel) => {
                channel.close_all();
                info!(%ws_name, "Channel removed");
                true
            }
            None => false,
        }
    }

    /// Returns provisioned channel names, excluding the admin channel.
    pub(crate) fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .channels
            .read()
            .keys()
            .filter(|name| name.as_str() != ADMIN_WS_NAME)
            .cloned()
            .collect();
        names.sort();
        names
    }
}

// ============================================================================
// Hub
// ============================================================================

/// WebSocket relay with a built-in admin object.
///
/// # Example
///
/// ```ignore
/// let hub = Hub::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000).await?;
/// let communicator = Communicator::initialize("127.0.0.1", hub.port()).await?;
/// ```
pub struct Hub {
    /// Address the listener is bound to.
    addr: SocketAddr,

    /// Shared state.
    inner: Arc<HubInner>,
}

// ============================================================================
// Hub - Constructor
// ============================================================================

impl Hub {
    /// Binds the hub and starts accepting peers.
    ///
    /// # Arguments
    ///
    /// * `ip` - Address to bind to
    /// * `port` - Port to bind to (0 for random)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let addr = listener.local_addr()?;

        let inner = Arc::new(HubInner::new());

        let registry = ServantRegistry::new();
        registry.add(admin::servant(Arc::downgrade(&inner)), ADMIN_IDENTITY)?;
        inner.channels.write().insert(
            ADMIN_WS_NAME.to_string(),
            Arc::new(Channel::local(ADMIN_WS_NAME, registry)),
        );

        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            accept_loop(accept_inner, listener).await;
        });

        info!(%addr, "Hub started");

        Ok(Self { addr, inner })
    }
}

// ============================================================================
// Hub - Public API
// ============================================================================

impl Hub {
    /// Returns the port the hub is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns the base WebSocket URL.
    ///
    /// Format: `ws://{ip}:{port}`
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Provisions a channel without going through the admin object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyUsedEndpoint`] if the name is taken.
    pub fn create_channel(&self, ws_name: &str) -> Result<()> {
        self.inner.create_channel(ws_name)
    }

    /// Removes a channel and closes its peers.
    pub fn remove_channel(&self, ws_name: &str) -> bool {
        self.inner.remove_channel(ws_name)
    }

    /// Returns provisioned channel names, sorted.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.inner.channel_names()
    }

    /// Returns the number of peers connected to `ws_name`.
    #[must_use]
    pub fn peer_count(&self, ws_name: &str) -> usize {
        self.inner.channel(ws_name).map_or(0, |c| c.peer_count())
    }

    /// Stops accepting peers and closes every connection.
    pub fn shutdown(&self) {
        info!(addr = %self.addr, "Hub shutting down");

        self.inner.shutdown.store(true, Ordering::SeqCst);

        let channels: Vec<_> = self.inner.channels.read().values().cloned().collect();
        for channel in channels {
            channel.close_all();
        }
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Background task that accepts new peers.
async fn accept_loop(inner: Arc<HubInner>, listener: TcpListener) {
    debug!("Accept loop started");

    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            debug!("Accept loop shutting down");
            break;
        }

        // Accept with timeout to allow checking shutdown flag
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(inner, stream, addr).await {
                        warn!(error = %e, ?addr, "Peer connection failed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed");
            }
            Err(_) => continue,
        }
    }

    debug!("Accept loop terminated");
}

/// Handles one peer from handshake to disconnect.
async fn handle_connection(inner: Arc<HubInner>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let peer: PeerId = inner.next_peer.fetch_add(1, Ordering::Relaxed);
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let mut attached: Option<(Arc<Channel>, Role)> = None;

    // Attach before the upgrade response goes out, so the peer can never
    // send on a channel it is not yet part of.
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        attached = Some(admit(&inner, request, peer, outbox)?);
        Ok(response)
    })
    .await;

    let (channel, role) = match (handshake, attached) {
        (Ok(ws_stream), Some((channel, role))) => {
            let (ws_write, ws_read) = ws_stream.split();
            info!(channel = %channel.name(), peer, role = role.as_str(), ?addr, "Peer connected");
            run_peer(&channel, peer, ws_write, ws_read, &mut outbox_rx).await;
            (channel, role)
        }
        (Ok(_), None) => return Err(Error::protocol("handshake completed without a channel")),
        (Err(e), attached) => {
            if let Some((channel, _)) = attached {
                channel.detach(peer);
            }
            return Err(Error::connection(format!("handshake with {addr} failed: {e}")));
        }
    };

    channel.detach(peer);
    info!(channel = %channel.name(), peer, role = role.as_str(), "Peer disconnected");
    Ok(())
}

/// Pumps frames between one peer socket and its channel.
async fn run_peer(
    channel: &Channel,
    peer: PeerId,
    mut ws_write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut ws_read: SplitStream<WebSocketStream<TcpStream>>,
    outbox_rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    loop {
        tokio::select! {
            frame = ws_read.next() => match frame {
                Some(Ok(Message::Text(text))) => channel.handle_frame(peer, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(channel = %channel.name(), peer, error = %e, "Peer read failed");
                    break;
                }
                // Ignore Binary, Ping, Pong
                Some(Ok(_)) => {}
            },

            message = outbox_rx.recv() => match message {
                Some(Message::Close(frame)) => {
                    let _ = ws_write.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if let Err(e) = ws_write.send(message).await {
                        debug!(channel = %channel.name(), peer, error = %e, "Peer write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = ws_write.close().await;
}

/// Decides whether a handshake may proceed and attaches the peer.
fn admit(
    inner: &HubInner,
    request: &Request,
    peer: PeerId,
    outbox: Outbox,
) -> std::result::Result<(Arc<Channel>, Role), ErrorResponse> {
    let raw = request.uri().path().trim_start_matches('/');
    let ws_name = urlencoding::decode(raw)
        .map_err(|_| reject(StatusCode::BAD_REQUEST, "undecodable channel name"))?;

    let role = request
        .headers()
        .get(ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(Role::from_header)
        .unwrap_or(Role::Client);

    let channel = inner
        .channel(&ws_name)
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "channel is not provisioned"))?;

    channel
        .attach(peer, role, outbox)
        .map_err(|_| reject(StatusCode::CONFLICT, "channel already has an adapter"))?;

    Ok((channel, role))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

// ============================================================================
// Tests
// ============================================================================
