//! Audience computation and fan-out to per-connection outboxes.
//!
//! Routing is split in two:
//!
//! 1. [`plan`] / [`plan_persisted`]: pure functions that validate an inbound
//!    event, normalize its payload and decide the [`Audience`].
//! 2. [`BroadcastRouter::dispatch`]: encodes the event once and pushes the
//!    shared bytes into every recipient's bounded outbox with `try_send`.
//!    A full or closed outbox is counted as dropped; dispatch never waits on
//!    a recipient.
//!
//! Audience rules:
//!
//! | Inbound                         | Audience                         |
//! |---------------------------------|----------------------------------|
//! | `send-message`, write-path      | every member of the room         |
//! | `send-message`, peer            | room members except the origin   |
//! | typing, edits, reactions, acks  | every member of the room         |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{
    now_millis, ChatMessage, ClientEvent, ConnectionId, DeliveryReceipt, MessageId,
    MessageStatus, RoomId, ServerEvent, UserId,
};
use crate::rooms::RoomMembership;

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Already persisted; produced by the write API on the sender's behalf.
    WritePath,
    /// Sent directly by a user-bound connection before persistence.
    Peer(ConnectionId),
}

/// Set of connections an event is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Room {
        room: RoomId,
        except: Option<ConnectionId>,
    },
    Everyone,
    Connection(ConnectionId),
}

/// A validated, normalized event and its audience.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub audience: Audience,
    pub event: ServerEvent,
}

/// Reasons an inbound event is dropped instead of broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    MissingRoom,
    EmptyMessage,
    MissingMessageId,
    /// Session events (identify, join, …) are handled by the server, not routed.
    NotRoomScoped(&'static str),
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRoom => write!(f, "Event has no room id"),
            Self::EmptyMessage => write!(f, "Message has neither content nor attachment"),
            Self::MissingMessageId => write!(f, "Event has no message id"),
            Self::NotRoomScoped(name) => write!(f, "Event '{name}' is not room-scoped"),
        }
    }
}

impl std::error::Error for RouteError {}

fn require_room(room: &RoomId) -> Result<(), RouteError> {
    if room.is_empty() {
        return Err(RouteError::MissingRoom);
    }
    Ok(())
}

fn require_message(id: &MessageId) -> Result<(), RouteError> {
    if id.is_empty() {
        return Err(RouteError::MissingMessageId);
    }
    Ok(())
}

fn whole_room(room: &RoomId) -> Audience {
    Audience::Room {
        room: room.clone(),
        except: None,
    }
}

fn normalize_message(mut message: ChatMessage) -> Result<ChatMessage, RouteError> {
    require_room(&message.room_id)?;
    if !message.has_body() {
        return Err(RouteError::EmptyMessage);
    }
    if message.created_at == 0 {
        message.created_at = now_millis();
    }
    if message.status == MessageStatus::Sending {
        message.status = MessageStatus::Sent;
    }
    Ok(message)
}

/// Route a message that the write path has already persisted.
pub fn plan_persisted(message: ChatMessage) -> Result<Route, RouteError> {
    let message = normalize_message(message)?;
    Ok(Route {
        audience: whole_room(&message.room_id),
        event: ServerEvent::ReceiveMessage(message),
    })
}

/// Validate and route an inbound room event from `conn`.
///
/// `bound_user` is the user the connection identified as. A `send-message`
/// from an unbound connection is treated as write-path; from a bound one as
/// peer. For peer traffic the user fields of the payload are overwritten with
/// the bound user.
pub fn plan(
    conn: ConnectionId,
    bound_user: Option<&UserId>,
    event: ClientEvent,
) -> Result<Route, RouteError> {
    match event {
        ClientEvent::SendMessage(mut message) => {
            let origin = match bound_user {
                Some(user) => {
                    message.sender_id = user.clone();
                    Origin::Peer(conn)
                }
                None => Origin::WritePath,
            };
            let message = normalize_message(message)?;
            let except = match origin {
                Origin::Peer(origin_conn) => Some(origin_conn),
                Origin::WritePath => None,
            };
            Ok(Route {
                audience: Audience::Room {
                    room: message.room_id.clone(),
                    except,
                },
                event: ServerEvent::ReceiveMessage(message),
            })
        }

        ClientEvent::Typing(mut payload) => {
            require_room(&payload.room_id)?;
            if let Some(user) = bound_user {
                payload.user_id = user.clone();
            }
            Ok(Route {
                audience: whole_room(&payload.room_id),
                event: ServerEvent::UserTyping(payload),
            })
        }

        ClientEvent::StopTyping(mut payload) => {
            require_room(&payload.room_id)?;
            if let Some(user) = bound_user {
                payload.user_id = user.clone();
            }
            Ok(Route {
                audience: whole_room(&payload.room_id),
                event: ServerEvent::UserStopTyping(payload),
            })
        }

        ClientEvent::MessageUpdated(update) => {
            require_room(&update.room_id)?;
            require_message(&update.message_id)?;
            Ok(Route {
                audience: whole_room(&update.room_id),
                event: ServerEvent::MessageUpdated(update),
            })
        }

        ClientEvent::MessageDeleted(reference) => {
            require_room(&reference.room_id)?;
            require_message(&reference.message_id)?;
            Ok(Route {
                audience: whole_room(&reference.room_id),
                event: ServerEvent::MessageDeleted(reference),
            })
        }

        ClientEvent::ReactionUpdated(update) => {
            require_room(&update.room_id)?;
            require_message(&update.message_id)?;
            Ok(Route {
                audience: whole_room(&update.room_id),
                event: ServerEvent::ReactionUpdated(update),
            })
        }

        ClientEvent::MessageRead(mut receipt) => {
            require_room(&receipt.room_id)?;
            require_message(&receipt.message_id)?;
            if let Some(user) = bound_user {
                receipt.user_id = user.clone();
            }
            Ok(Route {
                audience: whole_room(&receipt.room_id),
                event: ServerEvent::MessageReadUpdate(receipt),
            })
        }

        ClientEvent::MessageDelivered(reference) => {
            require_room(&reference.room_id)?;
            require_message(&reference.message_id)?;
            Ok(Route {
                audience: whole_room(&reference.room_id),
                event: ServerEvent::MessageDeliveredUpdate(DeliveryReceipt {
                    message_id: reference.message_id,
                    room_id: reference.room_id,
                    user_id: bound_user.cloned(),
                }),
            })
        }

        other @ (ClientEvent::Identify(_)
        | ClientEvent::JoinRoom(_)
        | ClientEvent::LeaveRoom(_)
        | ClientEvent::GetOnlineUsers) => Err(RouteError::NotRoomScoped(other.name())),
    }
}

/// Statistics for monitoring router health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub events_dispatched: u64,
    pub copies_delivered: u64,
    pub copies_dropped: u64,
    pub events_rejected: u64,
    pub active_outboxes: usize,
}

/// Lock-free counters; read through `RouterStats` snapshots.
#[derive(Default)]
struct AtomicRouterStats {
    events_dispatched: AtomicU64,
    copies_delivered: AtomicU64,
    copies_dropped: AtomicU64,
    events_rejected: AtomicU64,
}

/// Encoded frame shared by every recipient of one dispatch.
pub type Frame = Arc<str>;

/// Fan-out over per-connection outboxes.
pub struct BroadcastRouter {
    rooms: Arc<RoomMembership>,
    outboxes: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    /// Frames buffered per connection before copies are dropped.
    capacity: usize,
    stats: AtomicRouterStats,
}

impl BroadcastRouter {
    pub fn new(rooms: Arc<RoomMembership>, capacity: usize) -> Self {
        Self {
            rooms,
            outboxes: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicRouterStats::default(),
        }
    }

    /// Open an outbox for `conn`; the connection task drains the receiver.
    pub async fn register(&self, conn: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outboxes.write().await.insert(conn, tx);
        rx
    }

    pub async fn unregister(&self, conn: ConnectionId) {
        self.outboxes.write().await.remove(&conn);
    }

    /// Record an event dropped before routing.
    pub fn reject(&self, err: &RouteError) {
        log::warn!("Dropping malformed event: {err}");
        self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliver `route` to its audience. Returns the number of copies queued.
    pub async fn dispatch(&self, route: &Route) -> Result<usize, crate::protocol::ProtocolError> {
        let frame: Frame = Arc::from(route.event.encode()?);
        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);

        let delivered = match &route.audience {
            Audience::Room { room, except } => {
                let members = self.rooms.members_of(room).await;
                let outboxes = self.outboxes.read().await;
                let mut delivered = 0;
                for conn in members.iter().filter(|c| Some(**c) != *except) {
                    if self.push(&outboxes, *conn, &frame) {
                        delivered += 1;
                    }
                }
                log::debug!(
                    "Dispatched {:?} to room {room}: {delivered}/{} recipients",
                    route.event.kind(),
                    members.len() - usize::from(except.is_some_and(|c| members.contains(&c))),
                );
                delivered
            }
            Audience::Everyone => {
                let outboxes = self.outboxes.read().await;
                let conns: Vec<ConnectionId> = outboxes.keys().copied().collect();
                conns
                    .into_iter()
                    .filter(|conn| self.push(&outboxes, *conn, &frame))
                    .count()
            }
            Audience::Connection(conn) => {
                let outboxes = self.outboxes.read().await;
                usize::from(self.push(&outboxes, *conn, &frame))
            }
        };
        Ok(delivered)
    }

    fn push(
        &self,
        outboxes: &HashMap<ConnectionId, mpsc::Sender<Frame>>,
        conn: ConnectionId,
        frame: &Frame,
    ) -> bool {
        let Some(tx) = outboxes.get(&conn) else {
            return false;
        };
        match tx.try_send(frame.clone()) {
            Ok(()) => {
                self.stats.copies_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbox for {conn} full, dropping frame");
                self.stats.copies_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.copies_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Number of open outboxes (live connections).
    pub async fn connection_count(&self) -> usize {
        self.outboxes.read().await.len()
    }

    /// Stats snapshot.
    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            events_dispatched: self.stats.events_dispatched.load(Ordering::Relaxed),
            copies_delivered: self.stats.copies_delivered.load(Ordering::Relaxed),
            copies_dropped: self.stats.copies_dropped.load(Ordering::Relaxed),
            events_rejected: self.stats.events_rejected.load(Ordering::Relaxed),
            active_outboxes: self.outboxes.read().await.len(),
        }
    }

    /// Outbox capacity per connection.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
