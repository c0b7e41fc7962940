//! Room membership: room → connections currently subscribed.
//!
//! Membership is per connection, not per user, so two tabs of the same user
//! are two members. Every operation is an idempotent set operation; unknown
//! rooms and connections are no-ops rather than errors.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::protocol::{ConnectionId, RoomId};

#[derive(Default)]
struct MembershipState {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    /// Reverse index used by `purge`.
    joined: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl MembershipState {
    fn remove(&mut self, room: &RoomId, conn: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(&conn);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = self.joined.get_mut(&conn) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.joined.remove(&conn);
            }
        }
        removed
    }
}

/// Concurrency-safe room → connections map.
#[derive(Default)]
pub struct RoomMembership {
    state: RwLock<MembershipState>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `conn` to `room`. Returns `false` if it was already a member.
    pub async fn join(&self, room: RoomId, conn: ConnectionId) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let inserted = state.rooms.entry(room.clone()).or_default().insert(conn);
        state.joined.entry(conn).or_default().insert(room);
        inserted
    }

    /// Unsubscribe `conn` from `room`. Returns `false` if it was not a member.
    pub async fn leave(&self, room: &RoomId, conn: ConnectionId) -> bool {
        self.state.write().await.remove(room, conn)
    }

    /// Connections currently subscribed to `room`.
    pub async fn members_of(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_member(&self, room: &RoomId, conn: ConnectionId) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Rooms `conn` has joined.
    pub async fn rooms_of(&self, conn: ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .state
            .read()
            .await
            .joined
            .get(&conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Remove `conn` from every room. Returns the rooms it left.
    pub async fn purge(&self, conn: ConnectionId) -> Vec<RoomId> {
        let mut state = self.state.write().await;
        let mut left: Vec<RoomId> = state
            .joined
            .remove(&conn)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        for room in &left {
            state.remove(room, conn);
        }
        left.sort();
        left
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }
}
