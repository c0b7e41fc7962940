//! Presence registry: which users are online, across all their connections.
//!
//! A user may hold several connections at once (tabs, devices). The registry
//! keeps a set of connection ids per user and reports only the edges of that
//! set's size:
//!
//! ```text
//!  attach(C, c1)   {}      → {c1}       Online(C)
//!  attach(C, c2)   {c1}    → {c1,c2}    (nothing)
//!  detach(c1)      {c1,c2} → {c2}       (nothing)
//!  detach(c2)      {c2}    → gone       Offline(C)
//! ```
//!
//! State is in-memory only. After a restart every client re-identifies and
//! the registry rebuilds itself.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::protocol::{ConnectionId, UserId};

/// Externally observable presence change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    Online(UserId),
    Offline(UserId),
}

#[derive(Default)]
struct PresenceState {
    /// user → live connections. An entry exists iff the set is non-empty.
    users: HashMap<UserId, HashSet<ConnectionId>>,
    /// Reverse index: connection → owning user.
    owners: HashMap<ConnectionId, UserId>,
    /// Last time each connection was answered a snapshot.
    last_snapshot: HashMap<ConnectionId, Instant>,
}

impl PresenceState {
    fn remove_connection(&mut self, conn: ConnectionId) -> Option<PresenceTransition> {
        let user = self.owners.remove(&conn)?;
        let now_empty = match self.users.get_mut(&user) {
            Some(conns) => {
                conns.remove(&conn);
                conns.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.users.remove(&user);
            return Some(PresenceTransition::Offline(user));
        }
        None
    }
}

/// Concurrency-safe user → connections map with transition detection.
pub struct PresenceRegistry {
    state: RwLock<PresenceState>,
    snapshot_cooldown: Duration,
}

impl PresenceRegistry {
    /// Create a registry. `snapshot_cooldown` is the per-connection window
    /// inside which repeated [`snapshot_for`](Self::snapshot_for) calls get
    /// no answer.
    pub fn new(snapshot_cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(PresenceState::default()),
            snapshot_cooldown,
        }
    }

    /// Bind `conn` to `user`.
    ///
    /// Returns `[Online(user)]` when this is the user's first connection.
    /// Re-attaching the same pair is a no-op. If `conn` was bound to another
    /// user it is moved, which may report that user going offline first.
    pub async fn attach(&self, user: UserId, conn: ConnectionId) -> Vec<PresenceTransition> {
        let mut state = self.state.write().await;
        let mut transitions = Vec::new();

        match state.owners.get(&conn).cloned() {
            Some(owner) if owner == user => return transitions,
            Some(_) => transitions.extend(state.remove_connection(conn)),
            None => {}
        }

        state.owners.insert(conn, user.clone());
        let conns = state.users.entry(user.clone()).or_default();
        let was_empty = conns.is_empty();
        conns.insert(conn);

        if was_empty {
            log::info!("Presence: {user} online (connection {conn})");
            transitions.push(PresenceTransition::Online(user));
        } else {
            log::debug!("Presence: {user} opened another connection ({conn})");
        }
        transitions
    }

    /// Unbind `conn`. Returns `Offline(user)` when it was the user's last
    /// connection; unknown connections are ignored.
    pub async fn detach(&self, conn: ConnectionId) -> Option<PresenceTransition> {
        let mut state = self.state.write().await;
        state.last_snapshot.remove(&conn);
        let transition = state.remove_connection(conn);
        if let Some(PresenceTransition::Offline(user)) = &transition {
            log::info!("Presence: {user} offline (last connection {conn} closed)");
        }
        transition
    }

    /// Online users, sorted.
    pub async fn snapshot(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        let mut users: Vec<UserId> = state.users.keys().cloned().collect();
        users.sort();
        users
    }

    /// Rate-limited snapshot for one requesting connection.
    ///
    /// Returns `None` if the same connection was answered within the
    /// cooldown window.
    pub async fn snapshot_for(&self, conn: ConnectionId) -> Option<Vec<UserId>> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        if let Some(last) = state.last_snapshot.get(&conn) {
            if now.duration_since(*last) < self.snapshot_cooldown {
                log::debug!("Presence: snapshot request from {conn} throttled");
                return None;
            }
        }
        state.last_snapshot.insert(conn, now);

        let mut users: Vec<UserId> = state.users.keys().cloned().collect();
        users.sort();
        Some(users)
    }

    /// User bound to `conn`, if it has identified.
    pub async fn owner_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.state.read().await.owners.get(&conn).cloned()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.state.read().await.users.contains_key(user)
    }

    pub async fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .users
            .get(user)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn online_count(&self) -> usize {
        self.state.read().await.users.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
