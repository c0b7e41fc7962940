//! # parley-realtime: real-time chat engine
//!
//! Presence, room-scoped broadcast and client-side reconciliation for a
//! WebSocket chat service.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   JSON envelopes   ┌─────────────────────┐
//! │ ConnectionManager  │ ◄────────────────► │ ChatServer          │
//! │ (one per process)  │   over WebSocket   │  ├ PresenceRegistry │
//! └─────────┬──────────┘                    │  ├ RoomMembership   │
//!           │ ServerEvent                   │  └ BroadcastRouter  │
//!           ▼                               └──────────▲──────────┘
//! ┌────────────────────┐   WriteApi                    │ publish_persisted
//! │ReconciliationEngine│ ─────────────► write path ────┘
//! │  └ OfflineQueue    │
//! └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire types and the `{"event", "data"}` envelope
//! - [`presence`]: user → connections with online/offline transitions
//! - [`rooms`]: room → connections membership
//! - [`broadcast`]: audience planning and outbox fan-out
//! - [`server`]: WebSocket server tying the above together
//! - [`client`]: connection manager, reconciliation and offline queue

pub mod protocol;
pub mod presence;
pub mod rooms;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Attachment, ChatMessage, ClientEvent, ConnectionId, MessageId, MessageStatus, ProtocolError,
    RoomId, ServerEvent, ServerEventKind, UserId,
};
pub use presence::{PresenceRegistry, PresenceTransition};
pub use rooms::RoomMembership;
pub use broadcast::{plan, plan_persisted, Audience, BroadcastRouter, Route, RouteError, RouterStats};
pub use server::{ChatHub, ChatServer, ServerConfig, ServerStats};
pub use client::{
    ApiError, ClientConfig, ClientError, ConnectionManager, ConnectionState, OfflineQueue,
    PersistedMessage, QueueConfig, QueueNotice, ReconcileConfig, Reconciled, ReconciliationEngine,
    WriteApi,
};
