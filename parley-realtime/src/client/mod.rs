//! Client side of the chat engine.
//!
//! - [`connection`]: the per-process WebSocket connection manager
//! - [`reconcile`]: merges optimistic, peer and write-path copies of messages
//! - [`queue`]: replays mutations made while offline
//! - [`api`]: the write-path and event-sink ports the engines depend on

pub mod api;
pub mod connection;
pub mod queue;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod mock;

pub use api::{ApiError, ClientError, EventSink, PersistedMessage, WriteApi};
pub use connection::{ClientConfig, ConnectionManager, ConnectionState, HandlerId};
pub use queue::{
    ActionKind, ActionPayload, ActionQueue, OfflineQueue, QueueConfig, QueueError, QueueNotice,
    QueuedAction,
};
pub use reconcile::{ReconcileConfig, Reconciled, ReconciliationEngine, Timeline};
