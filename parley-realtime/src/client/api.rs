//! Ports between the client engines and the outside world.
//!
//! [`WriteApi`] is the durable write path (usually an HTTP service that
//! persists a message and then publishes it into the room). [`EventSink`] is
//! the realtime side; [`ConnectionManager`](super::ConnectionManager)
//! implements it.

use async_trait::async_trait;

use super::queue::QueueError;
use crate::protocol::{ChatMessage, ClientEvent, MessageId, ProtocolError, Reactions};

/// Identity the write path assigned to a created message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub id: MessageId,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Write-path failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Network or server trouble; retrying may succeed.
    Transient(String),
    /// The request itself was refused.
    Rejected(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(e) => write!(f, "Write path unavailable: {e}"),
            Self::Rejected(e) => write!(f, "Write path rejected request: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Client-side errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    NotConnected,
    InvalidUrl(String),
    Transport(String),
    Protocol(ProtocolError),
    NoActiveRoom,
    Api(ApiError),
    Queue(QueueError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::InvalidUrl(url) => write!(f, "Invalid server url: {url}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::NoActiveRoom => write!(f, "No active room"),
            Self::Api(e) => write!(f, "{e}"),
            Self::Queue(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ApiError> for ClientError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

impl From<QueueError> for ClientError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

/// Durable write path.
#[async_trait]
pub trait WriteApi: Send + Sync {
    async fn create_message(&self, draft: &ChatMessage) -> Result<PersistedMessage, ApiError>;

    async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), ApiError>;

    async fn delete_message(&self, id: &MessageId) -> Result<(), ApiError>;

    async fn update_reactions(&self, id: &MessageId, reactions: &Reactions) -> Result<(), ApiError>;

    /// Record that the local user has read `id`.
    async fn mark_read(&self, id: &MessageId) -> Result<(), ApiError>;
}

/// Realtime event output.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;
}
