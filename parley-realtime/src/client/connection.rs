//! Realtime connection manager.
//!
//! One [`ConnectionManager`] per process owns the WebSocket to the chat
//! server. A supervisor task keeps it alive:
//!
//! ```text
//! Disconnected ─connect()─► Connecting ─ok─► Connected ─lost─► Reconnecting
//!                               │                                  │
//!                               └──────err──► Reconnecting ◄───────┘
//!                                                 │  (backoff 500ms … 10s)
//!                                                 └──► Connecting again
//! ```
//!
//! Each session starts with `identify` (once per session) followed by
//! `join-room` for every active room, before the state becomes `Connected`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::api::{ClientError, EventSink};
use crate::protocol::{ClientEvent, ProtocolError, RoomId, ServerEvent, ServerEventKind, UserId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

static SHARED: OnceLock<Arc<ConnectionManager>> = OnceLock::new();

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint of the chat server
    pub server_url: String,
    /// User to identify as on every new session
    pub user_id: Option<UserId>,
    /// First reconnect delay
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling
    pub reconnect_max_ms: u64,
    /// Buffer size of the outgoing and broadcast event channels
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            user_id: None,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 10_000,
            event_buffer: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Registration handle returned by [`ConnectionManager::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct ConnectionManager {
    config: ClientConfig,
    user: RwLock<Option<UserId>>,
    state: watch::Sender<ConnectionState>,
    /// Writer channel of the live session.
    outgoing: RwLock<Option<mpsc::Sender<String>>>,
    /// Set once `identify` went out on the current session.
    identified: AtomicBool,
    active_rooms: RwLock<BTreeSet<RoomId>>,
    handlers: RwLock<HashMap<ServerEventKind, Vec<(HandlerId, Handler)>>>,
    next_handler: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            user: RwLock::new(config.user_id.clone()),
            config,
            state,
            outgoing: RwLock::new(None),
            identified: AtomicBool::new(false),
            active_rooms: RwLock::new(BTreeSet::new()),
            handlers: RwLock::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            events,
            supervisor: Mutex::new(None),
            shutdown,
        })
    }

    /// The process-wide manager. `config` is used by the first caller only.
    pub fn shared(config: ClientConfig) -> Arc<Self> {
        SHARED.get_or_init(|| Self::new(config)).clone()
    }

    /// Start the supervisor. Calling it again while it runs is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let url = &self.config.server_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ClientError::InvalidUrl(url.clone()));
        }

        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        self.shutdown.send_replace(false);
        let manager = self.clone();
        *supervisor = Some(tokio::spawn(async move { manager.supervise().await }));
        Ok(())
    }

    /// Stop the supervisor and close the socket.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let task = self.supervisor.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Connection supervisor ended abnormally: {e}");
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let initial = Duration::from_millis(self.config.reconnect_initial_ms.max(1));
        let ceiling = Duration::from_millis(self.config.reconnect_max_ms).max(initial);
        let mut backoff = initial;
        let mut first = true;

        while !*shutdown.borrow() {
            self.set_state(if first {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });
            first = false;

            let attempt = tokio::select! {
                result = tokio_tungstenite::connect_async(self.config.server_url.as_str()) => result,
                _ = shutdown.changed() => break,
            };
            match attempt {
                Ok((ws, _)) => {
                    backoff = initial;
                    log::info!("Connected to {}", self.config.server_url);
                    self.run_session(ws, &mut shutdown).await;
                    log::info!("Connection to {} closed", self.config.server_url);
                }
                Err(e) => {
                    log::warn!("Connect to {} failed: {e}", self.config.server_url);
                }
            }

            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Reconnecting);
            log::debug!("Reconnecting in {backoff:?}");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
            backoff = (backoff * 2).min(ceiling);
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) {
        let (mut writer, mut reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.config.event_buffer.max(1));
        self.identified.store(false, Ordering::Release);

        {
            // Holding the room set until Connected makes a concurrent
            // `join_room` wait and then send its own `join-room`.
            let rooms = self.active_rooms.read().await;
            if let Err(e) = self.handshake(&mut writer, &rooms).await {
                log::warn!("Session handshake failed: {e}");
                return;
            }
            *self.outgoing.write().await = Some(out_tx);
            self.set_state(ConnectionState::Connected);
        }

        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = writer.send(Message::Text(text.into())).await {
                                log::error!("Send failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match ServerEvent::decode(text.as_str()) {
                            Ok(event) => self.deliver(event).await,
                            Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if writer.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                _ = shutdown.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        *self.outgoing.write().await = None;
        self.identified.store(false, Ordering::Release);
    }

    /// Identify and rejoin active rooms on a fresh socket.
    async fn handshake(
        &self,
        writer: &mut SplitSink<WsStream, Message>,
        rooms: &BTreeSet<RoomId>,
    ) -> Result<(), ClientError> {
        let mut frames = Vec::new();
        if let Some(user) = self.user.read().await.clone() {
            if !self.identified.swap(true, Ordering::AcqRel) {
                frames.push(ClientEvent::Identify(user).encode()?);
            }
        }
        for room in rooms {
            frames.push(ClientEvent::JoinRoom(room.clone()).encode()?);
        }
        let rejoined = frames.len();
        for frame in frames {
            writer
                .send(Message::Text(frame.into()))
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
        }
        log::debug!("Session handshake sent {rejoined} frames");
        Ok(())
    }

    async fn deliver(&self, event: ServerEvent) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .await
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            log::debug!("Connection state: {next:?}");
        }
    }

    /// Set the identity used for `identify`. Identifies immediately if the
    /// current session has not done so yet.
    pub async fn set_user(&self, user: UserId) -> Result<(), ClientError> {
        *self.user.write().await = Some(user.clone());
        if self.is_connected() && !self.identified.swap(true, Ordering::AcqRel) {
            self.emit(ClientEvent::Identify(user)).await?;
        }
        Ok(())
    }

    /// Send an event on the live session.
    pub async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let text = event.encode()?;
        let outgoing = self.outgoing.read().await.clone();
        let tx = outgoing.ok_or(ClientError::NotConnected)?;
        tx.send(text)
            .await
            .map_err(|_| ClientError::Transport("session writer closed".to_string()))
    }

    /// Add `room` to the active set and join it now if connected.
    pub async fn join_room(&self, room: RoomId) -> Result<(), ClientError> {
        let mut rooms = self.active_rooms.write().await;
        let inserted = rooms.insert(room.clone());
        if inserted && self.is_connected() {
            self.emit(ClientEvent::JoinRoom(room)).await?;
        }
        Ok(())
    }

    /// Remove `room` from the active set and leave it now if connected.
    pub async fn leave_room(&self, room: &RoomId) -> Result<(), ClientError> {
        let mut rooms = self.active_rooms.write().await;
        let removed = rooms.remove(room);
        if removed && self.is_connected() {
            self.emit(ClientEvent::LeaveRoom(room.clone())).await?;
        }
        Ok(())
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.active_rooms.read().await.iter().cloned().collect()
    }

    /// Register a handler for one event kind.
    pub async fn on<F>(&self, kind: ServerEventKind, handler: F) -> HandlerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub async fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Stream of every server event.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut states = self.state.subscribe();
        let connected = states.wait_for(|s| *s == ConnectionState::Connected);
        // The watch guard must not outlive `states`.
        let result = match tokio::time::timeout(timeout, async { connected.await.map(|_| ()) }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Protocol(ProtocolError::Timeout)),
        };
        result
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }
}

#[async_trait]
impl EventSink for ConnectionManager {
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        ConnectionManager::emit(self, event).await
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }
}
