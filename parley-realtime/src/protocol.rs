//! JSON wire protocol for chat events.
//!
//! Every frame is a WebSocket text frame carrying one envelope:
//! ```text
//! {"event": "send-message", "data": { "id": "tmp_…", "roomId": "r1", … }}
//! ```
//!
//! Client→server events are [`ClientEvent`], server→client events are
//! [`ServerEvent`]. Payload fields are camelCase on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Prefix that marks a client-generated, non-durable message id.
pub const TEMP_ID_PREFIX: &str = "tmp_";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id! {
    /// Identity of a chat user, as resolved by the authentication layer.
    UserId
}

string_id! {
    /// Identity of a room (a named broadcast scope).
    RoomId
}

string_id! {
    /// Message identity: durable (issued by the write path) or temporary.
    MessageId
}

impl MessageId {
    /// Generate a fresh temporary id for an optimistic message.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Whether this id was generated client-side and is not yet durable.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Whether this id was issued by the write path.
    pub fn is_durable(&self) -> bool {
        !self.is_empty() && !self.is_temporary()
    }
}

/// Server-assigned identity of one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position along sending → sent → delivered → read.
    ///
    /// `Failed` is off the progression and returns `None`.
    pub fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether moving to `next` advances the status.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(cur), Some(new)) => new > cur,
            _ => false,
        }
    }
}

/// Reference to an uploaded file. Upload itself is handled elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Emoji → users who reacted with it.
pub type Reactions = BTreeMap<String, Vec<UserId>>;

/// The unit of chat content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Unix milliseconds.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: Reactions,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl ChatMessage {
    /// Create an optimistic message with a temporary id and `sending` status.
    pub fn optimistic(room_id: RoomId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::temporary(),
            room_id,
            sender_id,
            sender_name: None,
            content: content.into(),
            attachment: None,
            created_at: now_millis(),
            status: MessageStatus::Sending,
            reply_to: None,
            reactions: Reactions::new(),
            is_edited: false,
            is_deleted: false,
        }
    }

    /// Create a message carrying an explicit id (durable or temporary).
    pub fn with_id(
        id: impl Into<MessageId>,
        room_id: impl Into<RoomId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            content: content.into(),
            attachment: None,
            created_at: now_millis(),
            status: MessageStatus::Sent,
            reply_to: None,
            reactions: Reactions::new(),
            is_edited: false,
            is_deleted: false,
        }
    }

    /// Whether the message carries something to show.
    pub fn has_body(&self) -> bool {
        !self.content.trim().is_empty() || self.attachment.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTypingPayload {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub message_id: MessageId,
    pub content: String,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: MessageId,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    pub room_id: RoomId,
    #[serde(default)]
    pub reactions: Reactions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    #[serde(default)]
    pub user_id: UserId,
    pub room_id: RoomId,
}

/// Delivered acknowledgment as broadcast by the server.
///
/// `user_id` is the acknowledging connection's bound user, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// Events sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Identify(UserId),
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    GetOnlineUsers,
    SendMessage(ChatMessage),
    Typing(TypingPayload),
    StopTyping(StopTypingPayload),
    MessageUpdated(MessageUpdate),
    MessageDeleted(MessageRef),
    ReactionUpdated(ReactionUpdate),
    MessageRead(ReadReceipt),
    MessageDelivered(MessageRef),
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Identify(_) => "identify",
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::LeaveRoom(_) => "leave-room",
            ClientEvent::GetOnlineUsers => "get-online-users",
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::StopTyping(_) => "stop-typing",
            ClientEvent::MessageUpdated(_) => "message-updated",
            ClientEvent::MessageDeleted(_) => "message-deleted",
            ClientEvent::ReactionUpdated(_) => "reaction-updated",
            ClientEvent::MessageRead(_) => "message-read",
            ClientEvent::MessageDelivered(_) => "message-delivered",
        }
    }
}

/// Events sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    OnlineUsers(Vec<UserId>),
    UserOnline(UserId),
    UserOffline(UserId),
    ReceiveMessage(ChatMessage),
    UserTyping(TypingPayload),
    UserStopTyping(StopTypingPayload),
    MessageUpdated(MessageUpdate),
    MessageDeleted(MessageRef),
    ReactionUpdated(ReactionUpdate),
    MessageReadUpdate(ReadReceipt),
    MessageDeliveredUpdate(DeliveryReceipt),
}

/// Discriminant of [`ServerEvent`], used to register typed handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    OnlineUsers,
    UserOnline,
    UserOffline,
    ReceiveMessage,
    UserTyping,
    UserStopTyping,
    MessageUpdated,
    MessageDeleted,
    ReactionUpdated,
    MessageReadUpdate,
    MessageDeliveredUpdate,
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::OnlineUsers(_) => ServerEventKind::OnlineUsers,
            ServerEvent::UserOnline(_) => ServerEventKind::UserOnline,
            ServerEvent::UserOffline(_) => ServerEventKind::UserOffline,
            ServerEvent::ReceiveMessage(_) => ServerEventKind::ReceiveMessage,
            ServerEvent::UserTyping(_) => ServerEventKind::UserTyping,
            ServerEvent::UserStopTyping(_) => ServerEventKind::UserStopTyping,
            ServerEvent::MessageUpdated(_) => ServerEventKind::MessageUpdated,
            ServerEvent::MessageDeleted(_) => ServerEventKind::MessageDeleted,
            ServerEvent::ReactionUpdated(_) => ServerEventKind::ReactionUpdated,
            ServerEvent::MessageReadUpdate(_) => ServerEventKind::MessageReadUpdate,
            ServerEvent::MessageDeliveredUpdate(_) => ServerEventKind::MessageDeliveredUpdate,
        }
    }

    /// Room the event is scoped to, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            ServerEvent::OnlineUsers(_) | ServerEvent::UserOnline(_) | ServerEvent::UserOffline(_) => {
                None
            }
            ServerEvent::ReceiveMessage(m) => Some(&m.room_id),
            ServerEvent::UserTyping(p) => Some(&p.room_id),
            ServerEvent::UserStopTyping(p) => Some(&p.room_id),
            ServerEvent::MessageUpdated(p) => Some(&p.room_id),
            ServerEvent::MessageDeleted(p) => Some(&p.room_id),
            ServerEvent::ReactionUpdated(p) => Some(&p.room_id),
            ServerEvent::MessageReadUpdate(p) => Some(&p.room_id),
            ServerEvent::MessageDeliveredUpdate(p) => Some(&p.room_id),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
