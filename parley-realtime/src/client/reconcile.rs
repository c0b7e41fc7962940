//! Client-side message reconciliation.
//!
//! The same logical message can reach a client several times and under
//! different identities:
//!
//! ```text
//!   sender A                         server                      peer B
//!   optimistic tmp_1 ──peer send──►  room (except A) ──────────► tmp_1
//!   POST /messages ──► write API ──► room (everyone) ──► A: m_42, B: m_42
//! ```
//!
//! [`Timeline`] is the synchronous core: it owns the message list of the
//! active room, the duplicate-suppression window and the typing
//! indicators, and reports what it did as a [`Reconciled`] outcome. All time
//! is passed in explicitly. [`ReconciliationEngine`] wraps it with the side
//! effects (acknowledgments, write-path calls, offline deferral).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::api::{ClientError, EventSink, PersistedMessage, WriteApi};
use super::queue::{ActionKind, ActionPayload, OfflineQueue, QueueNotice};
use crate::protocol::{
    Attachment, ChatMessage, ClientEvent, MessageId, MessageRef, MessageStatus, MessageUpdate,
    Reactions, ReactionUpdate, ReadReceipt, RoomId, ServerEvent, StopTypingPayload,
    TypingPayload, UserId,
};

/// Reconciliation windows.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How long a received (id, room) identity suppresses redelivery
    pub dedup_window: Duration,
    /// Max `created_at` distance for matching an echo to an optimistic entry
    pub tie_window: Duration,
    /// How long a typing indicator lives without a refresh
    pub typing_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(3),
            tie_window: Duration::from_secs(5),
            typing_timeout: Duration::from_secs(3),
        }
    }
}

/// What [`Timeline::receive`] did with an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// New entry appended.
    Inserted(MessageId),
    /// Entry with that id existed; missing fields were filled in.
    Merged(MessageId),
    /// A temporary entry took on the incoming durable id.
    Upgraded { from: MessageId, to: MessageId },
    /// Same (id, room) seen inside the dedup window.
    DuplicateSuppressed,
    /// Local user's own temporary-id message coming back.
    OwnEcho,
    /// Already represented by a durable entry, or an own durable echo with
    /// nothing left to settle.
    AlreadySettled,
    /// Not for the active room.
    OtherRoom,
}

impl Reconciled {
    /// Whether the message became (or already was) part of the timeline.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Reconciled::Inserted(_) | Reconciled::Merged(_) | Reconciled::Upgraded { .. }
        )
    }
}

/// Keys that expire at a deadline, pruned on access.
#[derive(Debug)]
struct ExpiringSet<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash> ExpiringSet<K> {
    fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        self.deadlines.retain(|_, deadline| *deadline > now);
    }

    /// Mark `key` until `now + ttl`. Returns `false` if it was already live.
    fn mark(&mut self, key: K, now: Instant, ttl: Duration) -> bool {
        self.prune(now);
        if self.deadlines.contains_key(&key) {
            return false;
        }
        self.deadlines.insert(key, now + ttl);
        true
    }

    fn clear(&mut self) {
        self.deadlines.clear();
    }
}

#[derive(Debug, Clone)]
struct Typist {
    name: Option<String>,
    until: Instant,
}

/// Message list of one room plus the bookkeeping needed to merge
/// redeliveries into it.
#[derive(Debug)]
pub struct Timeline {
    local_user: UserId,
    room: Option<RoomId>,
    messages: Vec<ChatMessage>,
    seen: ExpiringSet<(MessageId, RoomId)>,
    typing: HashMap<UserId, Typist>,
    config: ReconcileConfig,
}

impl Timeline {
    pub fn new(local_user: UserId, config: ReconcileConfig) -> Self {
        Self {
            local_user,
            room: None,
            messages: Vec::new(),
            seen: ExpiringSet::new(),
            typing: HashMap::new(),
            config,
        }
    }

    /// Switch the active room. Resets messages, typing and the dedup window.
    pub fn set_room(&mut self, room: Option<RoomId>) {
        self.room = room;
        self.messages.clear();
        self.typing.clear();
        self.seen.clear();
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == *id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == *id)
    }

    fn is_active(&self, room: &RoomId) -> bool {
        self.room.as_ref() == Some(room)
    }

    /// Temporary entry that `incoming` is the durable form of.
    fn temporary_twin(&self, incoming: &ChatMessage) -> Option<usize> {
        let tie = self.config.tie_window.as_millis() as u64;
        self.messages.iter().position(|m| {
            m.id.is_temporary()
                && m.sender_id == incoming.sender_id
                && m.content == incoming.content
                && m.created_at.abs_diff(incoming.created_at) <= tie
        })
    }

    fn durable_twin(&self, incoming: &ChatMessage) -> Option<usize> {
        let tie = self.config.tie_window.as_millis() as u64;
        self.messages.iter().position(|m| {
            m.id.is_durable()
                && m.sender_id == incoming.sender_id
                && m.content == incoming.content
                && m.created_at.abs_diff(incoming.created_at) <= tie
        })
    }

    /// Merge a broadcast message into the timeline.
    pub fn receive(&mut self, incoming: ChatMessage, now: Instant) -> Reconciled {
        if !self.is_active(&incoming.room_id) {
            return Reconciled::OtherRoom;
        }

        let key = (incoming.id.clone(), incoming.room_id.clone());
        if !self.seen.mark(key, now, self.config.dedup_window) {
            log::debug!("Suppressed redelivery of {}", incoming.id);
            return Reconciled::DuplicateSuppressed;
        }

        let sender = incoming.sender_id.clone();
        let outcome = if sender == self.local_user {
            self.receive_own(incoming)
        } else {
            self.receive_peer(incoming)
        };

        if outcome.is_accepted() {
            self.typing.remove(&sender);
        }
        outcome
    }

    fn receive_own(&mut self, incoming: ChatMessage) -> Reconciled {
        if !incoming.id.is_durable() {
            return Reconciled::OwnEcho;
        }
        if self.position(&incoming.id).is_some() {
            return Reconciled::AlreadySettled;
        }
        match self.temporary_twin(&incoming) {
            Some(idx) => self.upgrade(idx, incoming),
            None => Reconciled::AlreadySettled,
        }
    }

    fn receive_peer(&mut self, incoming: ChatMessage) -> Reconciled {
        if let Some(idx) = self.position(&incoming.id) {
            merge_absent(&mut self.messages[idx], incoming);
            return Reconciled::Merged(self.messages[idx].id.clone());
        }
        if incoming.id.is_durable() {
            if let Some(idx) = self.temporary_twin(&incoming) {
                return self.upgrade(idx, incoming);
            }
        } else if self.durable_twin(&incoming).is_some() {
            // The write-path copy overtook the peer copy.
            return Reconciled::AlreadySettled;
        }
        let id = incoming.id.clone();
        self.messages.push(incoming);
        Reconciled::Inserted(id)
    }

    fn upgrade(&mut self, idx: usize, incoming: ChatMessage) -> Reconciled {
        let entry = &mut self.messages[idx];
        let from = std::mem::replace(&mut entry.id, incoming.id.clone());
        entry.created_at = incoming.created_at;
        if entry.status.can_advance_to(MessageStatus::Sent) {
            entry.status = MessageStatus::Sent;
        }
        merge_absent(entry, incoming);
        log::debug!("Upgraded {from} to {}", entry.id);
        Reconciled::Upgraded {
            from,
            to: entry.id.clone(),
        }
    }

    /// Add a locally created message.
    pub fn insert_optimistic(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Give a temporary entry the id the write path assigned.
    ///
    /// Returns `false` if the entry is gone or was already upgraded by an
    /// echo.
    pub fn confirm(&mut self, temp: &MessageId, persisted: &PersistedMessage) -> bool {
        let Some(idx) = self.position(temp) else {
            return false;
        };
        if self.position(&persisted.id).is_some() {
            // An echo already produced the durable entry.
            self.messages.remove(idx);
            return false;
        }
        let entry = &mut self.messages[idx];
        entry.id = persisted.id.clone();
        entry.created_at = persisted.created_at;
        if entry.status.can_advance_to(MessageStatus::Sent) {
            entry.status = MessageStatus::Sent;
        }
        true
    }

    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| m.id == *id) {
            Some(entry) => {
                entry.status = MessageStatus::Failed;
                true
            }
            None => false,
        }
    }

    pub fn apply_update(&mut self, update: &MessageUpdate) -> bool {
        if !self.is_active(&update.room_id) {
            return false;
        }
        match self.messages.iter_mut().find(|m| m.id == update.message_id) {
            Some(entry) => {
                entry.content = update.content.clone();
                entry.is_edited = true;
                true
            }
            None => false,
        }
    }

    pub fn apply_delete(&mut self, reference: &MessageRef) -> bool {
        if !self.is_active(&reference.room_id) {
            return false;
        }
        match self.messages.iter_mut().find(|m| m.id == reference.message_id) {
            Some(entry) => {
                entry.is_deleted = true;
                entry.content.clear();
                entry.attachment = None;
                true
            }
            None => false,
        }
    }

    pub fn apply_reactions(&mut self, update: &ReactionUpdate) -> bool {
        if !self.is_active(&update.room_id) {
            return false;
        }
        match self.messages.iter_mut().find(|m| m.id == update.message_id) {
            Some(entry) => {
                entry.reactions = update.reactions.clone();
                true
            }
            None => false,
        }
    }

    /// Advance the status of one of the local user's messages.
    ///
    /// Only moves forward along sending → sent → delivered → read; failed
    /// entries and other users' messages are left alone.
    pub fn apply_receipt(&mut self, room: &RoomId, id: &MessageId, status: MessageStatus) -> bool {
        if !self.is_active(room) {
            return false;
        }
        let local = &self.local_user;
        match self
            .messages
            .iter_mut()
            .find(|m| m.id == *id && m.sender_id == *local)
        {
            Some(entry) if entry.status.can_advance_to(status) => {
                entry.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn typing_started(&mut self, payload: &TypingPayload, now: Instant) -> bool {
        if !self.is_active(&payload.room_id) || payload.user_id == self.local_user {
            return false;
        }
        self.typing.insert(
            payload.user_id.clone(),
            Typist {
                name: payload.user_name.clone(),
                until: now + self.config.typing_timeout,
            },
        );
        true
    }

    pub fn typing_stopped(&mut self, payload: &StopTypingPayload) -> bool {
        if !self.is_active(&payload.room_id) {
            return false;
        }
        self.typing.remove(&payload.user_id).is_some()
    }

    /// Users currently typing, sorted, with display names when known.
    pub fn typing_users(&mut self, now: Instant) -> Vec<(UserId, Option<String>)> {
        self.typing.retain(|_, typist| typist.until > now);
        let mut users: Vec<(UserId, Option<String>)> = self
            .typing
            .iter()
            .map(|(user, typist)| (user.clone(), typist.name.clone()))
            .collect();
        users.sort();
        users
    }

    /// Reflect an offline-queue outcome in the timeline.
    pub fn apply_queue_notice(&mut self, notice: &QueueNotice) -> bool {
        match notice {
            QueueNotice::Replayed {
                kind: ActionKind::Send,
                message_id,
                persisted: Some(persisted),
                ..
            } => self.confirm(message_id, persisted),
            QueueNotice::PermanentFailure {
                kind: ActionKind::Send,
                message_id,
                ..
            } => self.mark_failed(message_id),
            _ => false,
        }
    }
}

/// Fill fields the local entry lacks from `incoming`, without duplicating.
fn merge_absent(entry: &mut ChatMessage, incoming: ChatMessage) {
    if entry.reply_to.is_none() {
        entry.reply_to = incoming.reply_to;
    }
    if entry.attachment.is_none() {
        entry.attachment = incoming.attachment;
    }
    if entry.sender_name.is_none() {
        entry.sender_name = incoming.sender_name;
    }
    for (emoji, users) in incoming.reactions {
        let known = entry.reactions.entry(emoji).or_default();
        for user in users {
            if !known.contains(&user) {
                known.push(user);
            }
        }
    }
}

/// Timeline plus the side effects of reconciliation.
pub struct ReconciliationEngine {
    timeline: Mutex<Timeline>,
    api: Arc<dyn WriteApi>,
    sink: Arc<dyn EventSink>,
    queue: Arc<OfflineQueue>,
}

impl ReconciliationEngine {
    pub fn new(
        local_user: UserId,
        config: ReconcileConfig,
        api: Arc<dyn WriteApi>,
        sink: Arc<dyn EventSink>,
        queue: Arc<OfflineQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            timeline: Mutex::new(Timeline::new(local_user, config)),
            api,
            sink,
            queue,
        })
    }

    pub async fn set_active_room(&self, room: Option<RoomId>) {
        self.timeline.lock().await.set_room(room);
    }

    /// Apply one server event.
    ///
    /// Returns the reconciliation outcome for `receive-message`, `None` for
    /// everything else.
    pub async fn handle_event(&self, event: &ServerEvent) -> Option<Reconciled> {
        let now = Instant::now();
        match event {
            ServerEvent::ReceiveMessage(message) => {
                let (outcome, user) = {
                    let mut timeline = self.timeline.lock().await;
                    let outcome = timeline.receive(message.clone(), now);
                    (outcome, timeline.local_user().clone())
                };
                let acked = match &outcome {
                    Reconciled::Inserted(id) => Some(id.clone()),
                    Reconciled::Upgraded { to, .. } if message.sender_id != user => Some(to.clone()),
                    _ => None,
                };
                if let Some(id) = acked.filter(MessageId::is_durable) {
                    self.acknowledge(id, message.room_id.clone(), user).await;
                }
                Some(outcome)
            }
            ServerEvent::UserTyping(payload) => {
                self.timeline.lock().await.typing_started(payload, now);
                None
            }
            ServerEvent::UserStopTyping(payload) => {
                self.timeline.lock().await.typing_stopped(payload);
                None
            }
            ServerEvent::MessageUpdated(update) => {
                self.timeline.lock().await.apply_update(update);
                None
            }
            ServerEvent::MessageDeleted(reference) => {
                self.timeline.lock().await.apply_delete(reference);
                None
            }
            ServerEvent::ReactionUpdated(update) => {
                self.timeline.lock().await.apply_reactions(update);
                None
            }
            ServerEvent::MessageReadUpdate(receipt) => {
                let mut timeline = self.timeline.lock().await;
                if receipt.user_id != *timeline.local_user() {
                    timeline.apply_receipt(&receipt.room_id, &receipt.message_id, MessageStatus::Read);
                }
                None
            }
            ServerEvent::MessageDeliveredUpdate(receipt) => {
                let mut timeline = self.timeline.lock().await;
                if receipt.user_id.as_ref() != Some(timeline.local_user()) {
                    timeline.apply_receipt(
                        &receipt.room_id,
                        &receipt.message_id,
                        MessageStatus::Delivered,
                    );
                }
                None
            }
            ServerEvent::OnlineUsers(_) | ServerEvent::UserOnline(_) | ServerEvent::UserOffline(_) => {
                None
            }
        }
    }

    /// Delivered, then read once the write path recorded it.
    async fn acknowledge(&self, id: MessageId, room: RoomId, user: UserId) {
        let delivered = ClientEvent::MessageDelivered(MessageRef {
            message_id: id.clone(),
            room_id: room.clone(),
        });
        if let Err(e) = self.sink.emit(delivered).await {
            log::debug!("Delivered ack for {id} not sent: {e}");
        }
        match self.api.mark_read(&id).await {
            Ok(()) => {
                let read = ClientEvent::MessageRead(ReadReceipt {
                    message_id: id.clone(),
                    user_id: user,
                    room_id: room,
                });
                if let Err(e) = self.sink.emit(read).await {
                    log::debug!("Read ack for {id} not sent: {e}");
                }
            }
            Err(e) => log::warn!("Failed to mark {id} read: {e}"),
        }
    }

    /// Optimistically send a message to the active room.
    ///
    /// Returns the durable id on success, or the temporary id when the send
    /// was deferred to the offline queue.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        attachment: Option<Attachment>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, ClientError> {
        let draft = {
            let mut timeline = self.timeline.lock().await;
            let room = timeline.room().cloned().ok_or(ClientError::NoActiveRoom)?;
            let mut draft = ChatMessage::optimistic(room, timeline.local_user().clone(), content);
            draft.attachment = attachment;
            draft.reply_to = reply_to;
            timeline.insert_optimistic(draft.clone());
            draft
        };

        if !self.sink.is_connected() {
            return self.defer_send(draft).await;
        }

        if let Err(e) = self.sink.emit(ClientEvent::SendMessage(draft.clone())).await {
            log::debug!("Peer send of {} skipped: {e}", draft.id);
        }

        match self.api.create_message(&draft).await {
            Ok(persisted) => {
                self.timeline.lock().await.confirm(&draft.id, &persisted);
                Ok(persisted.id)
            }
            Err(e) if !self.sink.is_connected() => {
                log::info!("Send of {} failed while offline ({e}), deferring", draft.id);
                self.defer_send(draft).await
            }
            Err(e) => {
                self.timeline.lock().await.mark_failed(&draft.id);
                Err(ClientError::Api(e))
            }
        }
    }

    async fn defer_send(&self, draft: ChatMessage) -> Result<MessageId, ClientError> {
        let temp = draft.id.clone();
        match self.queue.queue_action(ActionPayload::Send(draft)).await {
            Ok(_) => Ok(temp),
            Err(e) => {
                self.timeline.lock().await.mark_failed(&temp);
                Err(ClientError::Queue(e))
            }
        }
    }

    pub async fn edit_message(&self, id: &MessageId, content: impl Into<String>) -> Result<(), ClientError> {
        let update = MessageUpdate {
            message_id: id.clone(),
            content: content.into(),
            room_id: self.active_room().await?,
        };
        self.timeline.lock().await.apply_update(&update);
        self.mutate(ActionPayload::Edit(update)).await
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<(), ClientError> {
        let reference = MessageRef {
            message_id: id.clone(),
            room_id: self.active_room().await?,
        };
        self.timeline.lock().await.apply_delete(&reference);
        self.mutate(ActionPayload::Delete(reference)).await
    }

    pub async fn update_reactions(&self, id: &MessageId, reactions: Reactions) -> Result<(), ClientError> {
        let update = ReactionUpdate {
            message_id: id.clone(),
            room_id: self.active_room().await?,
            reactions,
        };
        self.timeline.lock().await.apply_reactions(&update);
        self.mutate(ActionPayload::React(update)).await
    }

    async fn active_room(&self) -> Result<RoomId, ClientError> {
        self.timeline
            .lock()
            .await
            .room()
            .cloned()
            .ok_or(ClientError::NoActiveRoom)
    }

    /// Persist a local mutation and announce it, or defer it when offline.
    async fn mutate(&self, action: ActionPayload) -> Result<(), ClientError> {
        if !self.sink.is_connected() {
            self.queue.queue_action(action).await?;
            return Ok(());
        }

        let (result, event) = match &action {
            ActionPayload::Edit(update) => (
                self.api.edit_message(&update.message_id, &update.content).await,
                ClientEvent::MessageUpdated(update.clone()),
            ),
            ActionPayload::Delete(reference) => (
                self.api.delete_message(&reference.message_id).await,
                ClientEvent::MessageDeleted(reference.clone()),
            ),
            ActionPayload::React(update) => (
                self.api.update_reactions(&update.message_id, &update.reactions).await,
                ClientEvent::ReactionUpdated(update.clone()),
            ),
            ActionPayload::Send(_) => return Err(ClientError::Transport("sends go through send_message".into())),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.sink.emit(event).await {
                    log::warn!("Persisted {} but could not announce it: {e}", action.kind().name());
                }
                Ok(())
            }
            Err(e) if !self.sink.is_connected() => {
                log::info!("{} failed while offline ({e}), deferring", action.kind().name());
                self.queue.queue_action(action).await?;
                Ok(())
            }
            Err(e) => Err(ClientError::Api(e)),
        }
    }

    pub async fn apply_queue_notice(&self, notice: &QueueNotice) -> bool {
        self.timeline.lock().await.apply_queue_notice(notice)
    }

    /// Feed server events into the engine until the stream closes.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Reconciliation lagged, {missed} events skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_event(&event).await;
            }
        })
    }

    /// Apply offline-queue outcomes until the queue goes away.
    pub fn spawn_notice_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let mut notices = self.queue.subscribe();
        tokio::spawn(async move {
            loop {
                let notice = match notices.recv().await {
                    Ok(notice) => notice,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Missed {missed} queue notices");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.apply_queue_notice(&notice).await;
            }
        })
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.timeline.lock().await.messages().to_vec()
    }

    pub async fn message(&self, id: &MessageId) -> Option<ChatMessage> {
        self.timeline.lock().await.get(id).cloned()
    }

    pub async fn typing_users(&self) -> Vec<(UserId, Option<String>)> {
        self.timeline.lock().await.typing_users(Instant::now())
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }
}
