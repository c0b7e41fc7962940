//! WebSocket chat relay with presence and room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── PresenceRegistry (user → conns)
//!            ├── handle_connection ──┤
//! Client B ──┘        │              └── RoomMembership   (room → conns)
//!                     ▼
//!               ChatHub::handle_event ── plan() ── BroadcastRouter
//!                                                      │
//!                                       ┌──────────────┼──────────────┐
//!                                       ▼              ▼              ▼
//!                                   outbox A       outbox B       outbox C
//! ```
//!
//! [`ChatHub`] owns all shared state and the event dispatch table; it has no
//! socket code and is driven directly in tests. [`ChatServer`] accepts
//! WebSocket connections and pumps frames between sockets and the hub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{plan, plan_persisted, Audience, BroadcastRouter, Frame, Route, RouteError, RouterStats};
use crate::presence::{PresenceRegistry, PresenceTransition};
use crate::protocol::{ChatMessage, ClientEvent, ConnectionId, ServerEvent};
use crate::rooms::RoomMembership;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before copies are dropped
    pub outbox_capacity: usize,
    /// Heartbeat (WebSocket ping) interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Per-connection window for `get-online-users` responses
    pub online_users_cooldown_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            heartbeat_interval_secs: 30,
            online_users_cooldown_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Read configuration from `PARLEY_*` environment variables, falling
    /// back to defaults for anything absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("PARLEY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            outbox_capacity: env_or("PARLEY_OUTBOX_CAPACITY", defaults.outbox_capacity),
            heartbeat_interval_secs: env_or("PARLEY_HEARTBEAT_SECS", defaults.heartbeat_interval_secs),
            online_users_cooldown_ms: env_or(
                "PARLEY_ONLINE_USERS_COOLDOWN_MS",
                defaults.online_users_cooldown_ms,
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring invalid {key}={raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub online_users: usize,
    pub router: RouterStats,
}

/// Shared server state and the inbound event dispatch table.
pub struct ChatHub {
    presence: PresenceRegistry,
    rooms: Arc<RoomMembership>,
    router: BroadcastRouter,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl ChatHub {
    pub fn new(config: &ServerConfig) -> Self {
        let rooms = Arc::new(RoomMembership::new());
        Self {
            presence: PresenceRegistry::new(Duration::from_millis(config.online_users_cooldown_ms)),
            router: BroadcastRouter::new(rooms.clone(), config.outbox_capacity),
            rooms,
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Register a new transport session and return its outbox.
    pub async fn open_connection(&self) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let conn = ConnectionId::new();
        let outbox = self.router.register(conn).await;
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        (conn, outbox)
    }

    /// Apply one inbound event from `conn`.
    pub async fn handle_event(&self, conn: ConnectionId, event: ClientEvent) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);

        match event {
            ClientEvent::Identify(user) => {
                if user.is_empty() {
                    log::warn!("Ignoring identify with empty user id from {conn}");
                    return;
                }
                let transitions = self.presence.attach(user, conn).await;
                self.announce(transitions).await;
            }

            ClientEvent::JoinRoom(room) => {
                if room.is_empty() {
                    self.router.reject(&RouteError::MissingRoom);
                    return;
                }
                if self.rooms.join(room.clone(), conn).await {
                    log::info!("Connection {conn} joined room {room}");
                }
            }

            ClientEvent::LeaveRoom(room) => {
                if self.rooms.leave(&room, conn).await {
                    log::info!("Connection {conn} left room {room}");
                }
            }

            ClientEvent::GetOnlineUsers => {
                if let Some(users) = self.presence.snapshot_for(conn).await {
                    self.send(Route {
                        audience: Audience::Connection(conn),
                        event: ServerEvent::OnlineUsers(users),
                    })
                    .await;
                }
            }

            room_event => {
                let bound = self.presence.owner_of(conn).await;
                match plan(conn, bound.as_ref(), room_event) {
                    Ok(route) => {
                        if let ServerEvent::UserTyping(_) | ServerEvent::UserStopTyping(_) = route.event {
                            log::trace!("Typing update from {conn}");
                        }
                        self.send(route).await;
                    }
                    Err(e) => self.router.reject(&e),
                }
            }
        }
    }

    /// Tear down `conn`: leave every room first so teardown broadcasts never
    /// count it as a recipient, then drop presence.
    pub async fn close_connection(&self, conn: ConnectionId) {
        let left = self.rooms.purge(conn).await;
        self.router.unregister(conn).await;
        if !left.is_empty() {
            log::debug!("Connection {conn} purged from {} rooms", left.len());
        }
        if let Some(transition) = self.presence.detach(conn).await {
            self.announce(vec![transition]).await;
        }
    }

    /// Broadcast a message that the write path has persisted.
    ///
    /// Reaches every room member, including the sender's own connections.
    pub async fn publish_persisted(&self, message: ChatMessage) -> Result<usize, RouteError> {
        match plan_persisted(message) {
            Ok(route) => Ok(self.send(route).await),
            Err(e) => {
                self.router.reject(&e);
                Err(e)
            }
        }
    }

    async fn announce(&self, transitions: Vec<PresenceTransition>) {
        for transition in transitions {
            let event = match transition {
                PresenceTransition::Online(user) => ServerEvent::UserOnline(user),
                PresenceTransition::Offline(user) => ServerEvent::UserOffline(user),
            };
            self.send(Route {
                audience: Audience::Everyone,
                event,
            })
            .await;
        }
    }

    async fn send(&self, route: Route) -> usize {
        match self.router.dispatch(&route).await {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", route.event.kind());
                0
            }
        }
    }

    fn record_inbound_bytes(&self, len: usize) {
        self.total_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomMembership {
        &self.rooms
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.router.connection_count().await,
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
            online_users: self.presence.online_count().await,
            router: self.router.stats().await,
        }
    }
}

/// The WebSocket server.
pub struct ChatServer {
    config: ServerConfig,
    hub: Arc<ChatHub>,
}

impl ChatServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(ChatHub::new(&config));
        Self { config, hub }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Chat server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<ChatHub>,
        heartbeat: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (conn, outbox) = hub.open_connection().await;
        log::info!("WebSocket connection {conn} established from {addr}");

        let result = Self::pump(ws_stream, conn, &hub, outbox, heartbeat).await;

        hub.close_connection(conn).await;
        log::info!("Connection {conn} from {addr} closed");
        result
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        conn: ConnectionId,
        hub: &ChatHub,
        mut outbox: mpsc::Receiver<Frame>,
        heartbeat: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut ticker = tokio::time::interval(heartbeat);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            hub.record_inbound_bytes(text.len());
                            match ClientEvent::decode(text.as_str()) {
                                Ok(event) => hub.handle_event(conn, event).await,
                                Err(e) => log::warn!("Failed to decode event from {conn}: {e}"),
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Ignoring {}-byte binary frame from {conn}", data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error on {conn}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Shared state, for in-process write-path publishing and inspection.
    pub fn hub(&self) -> Arc<ChatHub> {
        self.hub.clone()
    }

    /// Broadcast a persisted message. See [`ChatHub::publish_persisted`].
    pub async fn publish_persisted(&self, message: ChatMessage) -> Result<usize, RouteError> {
        self.hub.publish_persisted(message).await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
