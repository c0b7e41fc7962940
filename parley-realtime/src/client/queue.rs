//! Offline action queue.
//!
//! Mutations made while the realtime connection is down are queued here and
//! replayed in enqueue order once it comes back:
//!
//! ```text
//! queued ──► in-flight ──┬──► succeeded (removed, Replayed)
//!    ▲                   ├──► retry-scheduled ──(backoff)──┐
//!    └───────────────────┼─────────────────────────────────┘
//!                        └──► permanently failed (removed, PermanentFailure)
//! ```
//!
//! At most one replay pass runs at a time. A trigger that arrives while a
//! pass is running requests exactly one follow-up pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::api::{ApiError, EventSink, PersistedMessage, WriteApi};
use super::connection::ConnectionState;
use crate::protocol::{
    ChatMessage, ClientEvent, MessageId, MessageRef, MessageStatus, MessageUpdate, ReactionUpdate,
};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retries after the first attempt before an action is discarded
    pub max_retries: u32,
    /// Base retry delay, multiplied by the retry count
    pub retry_backoff: Duration,
    /// Pause between actions within one pass
    pub inter_action_delay: Duration,
    /// Wait after reconnecting before replay starts
    pub settle_delay: Duration,
    /// Maximum number of queued actions
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            inter_action_delay: Duration::from_millis(100),
            settle_delay: Duration::from_secs(1),
            max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Send,
    Edit,
    Delete,
    React,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Send => "send",
            ActionKind::Edit => "edit",
            ActionKind::Delete => "delete",
            ActionKind::React => "react",
        }
    }
}

/// What to replay. The variant determines the API call and the realtime
/// event emitted after it succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Send(ChatMessage),
    Edit(MessageUpdate),
    Delete(MessageRef),
    React(ReactionUpdate),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Send(_) => ActionKind::Send,
            ActionPayload::Edit(_) => ActionKind::Edit,
            ActionPayload::Delete(_) => ActionKind::Delete,
            ActionPayload::React(_) => ActionKind::React,
        }
    }

    /// Message the action applies to. For sends this is the temporary id.
    pub fn message_id(&self) -> &MessageId {
        match self {
            ActionPayload::Send(message) => &message.id,
            ActionPayload::Edit(update) => &update.message_id,
            ActionPayload::Delete(reference) => &reference.message_id,
            ActionPayload::React(update) => &update.message_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub id: Uuid,
    /// Enqueue order, kept across retries.
    pub seq: u64,
    pub payload: ActionPayload,
    pub retries: u32,
    pub queued_at: Instant,
}

impl QueuedAction {
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    Full { max_size: usize },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full { max_size } => write!(f, "Offline queue full ({max_size} actions)"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Outcome reports for queued actions.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueNotice {
    Deferred {
        action: Uuid,
        kind: ActionKind,
        message_id: MessageId,
    },
    Replayed {
        action: Uuid,
        kind: ActionKind,
        message_id: MessageId,
        /// Durable identity, for replayed sends.
        persisted: Option<PersistedMessage>,
    },
    PermanentFailure {
        action: Uuid,
        kind: ActionKind,
        message_id: MessageId,
        error: ApiError,
    },
}

impl QueueNotice {
    pub fn message_id(&self) -> &MessageId {
        match self {
            QueueNotice::Deferred { message_id, .. }
            | QueueNotice::Replayed { message_id, .. }
            | QueueNotice::PermanentFailure { message_id, .. } => message_id,
        }
    }
}

/// Bounded FIFO of pending actions.
#[derive(Debug)]
pub struct ActionQueue {
    queue: VecDeque<QueuedAction>,
    max_size: usize,
    next_seq: u64,
}

impl ActionQueue {
    /// Create a new queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            next_seq: 0,
        }
    }

    /// Append an action with a zero retry count.
    pub fn enqueue(&mut self, payload: ActionPayload) -> Result<Uuid, QueueError> {
        if self.queue.len() >= self.max_size {
            return Err(QueueError::Full {
                max_size: self.max_size,
            });
        }
        let id = Uuid::new_v4();
        self.next_seq += 1;
        self.queue.push_back(QueuedAction {
            id,
            seq: self.next_seq,
            payload,
            retries: 0,
            queued_at: Instant::now(),
        });
        Ok(id)
    }

    /// Put back an action whose retry delay elapsed, at its original position.
    pub fn requeue(&mut self, action: QueuedAction) {
        let at = self
            .queue
            .iter()
            .position(|queued| queued.seq > action.seq)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, action);
    }

    pub fn pop_front(&mut self) -> Option<QueuedAction> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedAction> {
        self.queue.iter()
    }
}

/// Replays queued actions through the write path and the realtime sink.
pub struct OfflineQueue {
    config: QueueConfig,
    api: Arc<dyn WriteApi>,
    sink: Arc<dyn EventSink>,
    actions: Mutex<ActionQueue>,
    processing: AtomicBool,
    rerun: AtomicBool,
    timers: StdMutex<Vec<JoinHandle<()>>>,
    driver: StdMutex<Option<JoinHandle<()>>>,
    notices: broadcast::Sender<QueueNotice>,
}

impl OfflineQueue {
    pub fn new(config: QueueConfig, api: Arc<dyn WriteApi>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let (notices, _) = broadcast::channel(256);
        Arc::new(Self {
            actions: Mutex::new(ActionQueue::new(config.max_size)),
            config,
            api,
            sink,
            processing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            timers: StdMutex::new(Vec::new()),
            driver: StdMutex::new(None),
            notices,
        })
    }

    /// Receive outcome reports.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueNotice> {
        self.notices.subscribe()
    }

    /// Queue an action for replay once connected.
    pub async fn queue_action(&self, payload: ActionPayload) -> Result<Uuid, QueueError> {
        let kind = payload.kind();
        let message_id = payload.message_id().clone();
        let id = self.actions.lock().await.enqueue(payload)?;
        log::info!("Queued {} action {id} for message {message_id}", kind.name());
        self.notify(QueueNotice::Deferred {
            action: id,
            kind,
            message_id,
        });
        Ok(id)
    }

    /// Replay queued actions if connected and no pass is running.
    pub async fn process_queue(self: &Arc<Self>) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.rerun.store(true, Ordering::Release);
            log::debug!("Queue pass already running, follow-up requested");
            return;
        }

        loop {
            self.rerun.store(false, Ordering::Release);
            self.run_pass().await;
            self.processing.store(false, Ordering::Release);

            if !self.needs_another_pass().await {
                break;
            }
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                break;
            }
        }
    }

    /// Checked after releasing the pass flag. A trigger that lost the race
    /// for the flag may not have raised `rerun` yet, but its action is
    /// already back in the queue.
    async fn needs_another_pass(&self) -> bool {
        let requested = self.rerun.swap(false, Ordering::AcqRel);
        let pending = !self.actions.lock().await.is_empty();
        (requested || pending) && self.sink.is_connected()
    }

    async fn run_pass(self: &Arc<Self>) {
        let mut replayed = 0usize;
        loop {
            if !self.sink.is_connected() {
                log::debug!("Queue pass stopped: not connected");
                break;
            }
            let Some(action) = self.actions.lock().await.pop_front() else {
                break;
            };

            match self.execute(&action).await {
                Ok(persisted) => {
                    replayed += 1;
                    log::debug!(
                        "Replayed {} action {} queued {:?} ago",
                        action.kind().name(),
                        action.id,
                        action.queued_at.elapsed(),
                    );
                    self.notify(QueueNotice::Replayed {
                        action: action.id,
                        kind: action.kind(),
                        message_id: action.payload.message_id().clone(),
                        persisted,
                    });
                }
                Err(error) => self.fail(action, error),
            }

            if self.actions.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(self.config.inter_action_delay).await;
        }
        if replayed > 0 {
            log::info!("Replayed {replayed} queued actions");
        }
    }

    async fn execute(&self, action: &QueuedAction) -> Result<Option<PersistedMessage>, ApiError> {
        match &action.payload {
            ActionPayload::Send(draft) => {
                let persisted = self.api.create_message(draft).await?;
                let mut message = draft.clone();
                message.id = persisted.id.clone();
                message.created_at = persisted.created_at;
                message.status = MessageStatus::Sent;
                self.announce(ClientEvent::SendMessage(message)).await;
                Ok(Some(persisted))
            }
            ActionPayload::Edit(update) => {
                self.api.edit_message(&update.message_id, &update.content).await?;
                self.announce(ClientEvent::MessageUpdated(update.clone())).await;
                Ok(None)
            }
            ActionPayload::Delete(reference) => {
                self.api.delete_message(&reference.message_id).await?;
                self.announce(ClientEvent::MessageDeleted(reference.clone())).await;
                Ok(None)
            }
            ActionPayload::React(update) => {
                self.api.update_reactions(&update.message_id, &update.reactions).await?;
                self.announce(ClientEvent::ReactionUpdated(update.clone())).await;
                Ok(None)
            }
        }
    }

    async fn announce(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.sink.emit(event).await {
            log::warn!("Replayed action persisted but '{name}' was not emitted: {e}");
        }
    }

    fn fail(self: &Arc<Self>, mut action: QueuedAction, error: ApiError) {
        action.retries += 1;
        if error.is_transient() && action.retries <= self.config.max_retries {
            let delay = self.config.retry_backoff * action.retries;
            log::warn!(
                "Queued {} action {} failed ({error}), retry {}/{} in {delay:?}",
                action.kind().name(),
                action.id,
                action.retries,
                self.config.max_retries,
            );
            self.schedule_retry(action, delay);
        } else {
            log::error!(
                "Queued {} action {} failed permanently after {} attempts over {:?}: {error}",
                action.kind().name(),
                action.id,
                action.retries,
                action.queued_at.elapsed(),
            );
            self.notify(QueueNotice::PermanentFailure {
                action: action.id,
                kind: action.kind(),
                message_id: action.payload.message_id().clone(),
                error,
            });
        }
    }

    fn schedule_retry(self: &Arc<Self>, action: QueuedAction, delay: Duration) {
        let queue = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.actions.lock().await.requeue(action);
                queue.process_queue().await;
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.retain(|timer| !timer.is_finished());
        timers.push(handle);
    }

    /// Replay automatically whenever `states` moves into `Connected`.
    pub fn start(self: &Arc<Self>, mut states: watch::Receiver<ConnectionState>) {
        let weak = Arc::downgrade(self);
        let settle_delay = self.config.settle_delay;
        let mut previous = *states.borrow_and_update();
        let handle = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let current = *states.borrow_and_update();
                let reconnected =
                    previous != ConnectionState::Connected && current == ConnectionState::Connected;
                previous = current;
                if !reconnected {
                    continue;
                }

                let Some(queue) = weak.upgrade() else {
                    break;
                };
                if queue.is_empty().await {
                    continue;
                }
                log::info!("Connection restored, replaying {} queued actions", queue.len().await);
                tokio::time::sleep(settle_delay).await;
                queue.process_queue().await;
            }
        });

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = driver.replace(handle) {
            previous.abort();
        }
    }

    /// Drop every queued action and cancel pending retries.
    pub async fn clear(&self) {
        self.actions.lock().await.clear();
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    /// Snapshot of queued actions in replay order.
    pub async fn pending(&self) -> Vec<QueuedAction> {
        self.actions.lock().await.iter().cloned().collect()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    fn notify(&self, notice: QueueNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

impl Drop for OfflineQueue {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
        let driver = self.driver.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = driver.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockApi, MockSink};
    use crate::protocol::RoomId;

    fn edit(id: &str, content: &str) -> ActionPayload {
        ActionPayload::Edit(MessageUpdate {
            message_id: MessageId::from(id),
            content: content.to_string(),
            room_id: RoomId::from("r1"),
        })
    }

    fn setup(api: MockApi, sink: MockSink) -> (Arc<OfflineQueue>, Arc<MockApi>, Arc<MockSink>) {
        let api = Arc::new(api);
        let sink = Arc::new(sink);
        let queue = OfflineQueue::new(QueueConfig::default(), api.clone(), sink.clone());
        (queue, api, sink)
    }

    fn drain(rx: &mut broadcast::Receiver<QueueNotice>) -> Vec<QueueNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    #[test]
    fn test_action_queue_capacity() {
        let mut queue = ActionQueue::new(2);
        assert!(queue.enqueue(edit("m_1", "a")).is_ok());
        assert!(queue.enqueue(edit("m_2", "b")).is_ok());
        assert_eq!(queue.enqueue(edit("m_3", "c")), Err(QueueError::Full { max_size: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_keeps_enqueue_order() {
        let mut queue = ActionQueue::new(10);
        queue.enqueue(edit("m_1", "a")).unwrap();
        queue.enqueue(edit("m_2", "b")).unwrap();
        queue.enqueue(edit("m_3", "c")).unwrap();

        let first = queue.pop_front().unwrap();
        let queued_at = first.queued_at;
        queue.requeue(first);
        assert_eq!(queue.iter().next().unwrap().queued_at, queued_at);
        let order: Vec<&str> = queue.iter().map(|a| a.payload.message_id().as_str()).collect();
        assert_eq!(order, vec!["m_1", "m_2", "m_3"]);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_in_order_and_emit() {
        let (queue, api, sink) = setup(MockApi::default(), MockSink::connected());
        let mut notices = queue.subscribe();

        queue.queue_action(edit("m_1", "first")).await.unwrap();
        queue
            .queue_action(ActionPayload::Delete(MessageRef {
                message_id: MessageId::from("m_2"),
                room_id: RoomId::from("r1"),
            }))
            .await
            .unwrap();
        queue.process_queue().await;

        assert_eq!(api.calls(), vec!["edit:m_1:first", "delete:m_2"]);
        assert_eq!(sink.names(), vec!["message-updated", "message-deleted"]);
        assert!(queue.is_empty().await);

        let notices = drain(&mut notices);
        assert_eq!(notices.len(), 4);
        assert!(matches!(notices[2], QueueNotice::Replayed { kind: ActionKind::Edit, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_send_carries_durable_id() {
        let (queue, _api, sink) = setup(MockApi::default(), MockSink::connected());
        let mut notices = queue.subscribe();
        let draft = ChatMessage::optimistic(RoomId::from("r1"), "A".into(), "hello");
        let temp = draft.id.clone();

        queue.queue_action(ActionPayload::Send(draft)).await.unwrap();
        queue.process_queue().await;

        match drain(&mut notices).as_slice() {
            [QueueNotice::Deferred { .. }, QueueNotice::Replayed { message_id, persisted: Some(p), .. }] => {
                assert_eq!(message_id, &temp);
                assert_eq!(p.id.as_str(), "m_1");
            }
            other => panic!("Unexpected notices {other:?}"),
        }
        match sink.emitted().as_slice() {
            [ClientEvent::SendMessage(m)] => {
                assert_eq!(m.id.as_str(), "m_1");
                assert_eq!(m.status, MessageStatus::Sent);
            }
            other => panic!("Unexpected events {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_action_attempted_four_times() {
        let (queue, api, _sink) = setup(MockApi::failing(), MockSink::connected());
        let mut notices = queue.subscribe();

        queue.queue_action(edit("m_1", "x")).await.unwrap();
        queue.process_queue().await;
        // Backoff 1s + 2s + 3s.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(api.calls().len(), 4);
        assert!(queue.is_empty().await);
        let failures: Vec<_> = drain(&mut notices)
            .into_iter()
            .filter(|n| matches!(n, QueueNotice::PermanentFailure { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let (queue, api, sink) = setup(MockApi::default(), MockSink::connected());
        api.fail_next(1);

        queue.queue_action(edit("m_1", "x")).await.unwrap();
        queue.process_queue().await;
        assert_eq!(queue.len().await, 0);
        assert!(sink.emitted().is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(api.calls().len(), 2);
        assert_eq!(sink.names(), vec!["message-updated"]);
    }

    #[tokio::test]
    async fn test_no_processing_while_disconnected() {
        let (queue, api, _sink) = setup(MockApi::default(), MockSink::default());
        queue.queue_action(edit("m_1", "x")).await.unwrap();
        queue.process_queue().await;
        assert!(api.calls().is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let (queue, api, _sink) = setup(MockApi::default(), MockSink::connected());
        for i in 0..3 {
            queue.queue_action(edit(&format!("m_{i}"), "x")).await.unwrap();
        }

        tokio::join!(queue.process_queue(), queue.process_queue());
        assert_eq!(api.calls().len(), 3);
        assert!(!queue.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_retries() {
        let (queue, api, _sink) = setup(MockApi::failing(), MockSink::connected());
        queue.queue_action(edit("m_1", "x")).await.unwrap();
        queue.process_queue().await;
        queue.clear().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let api = Arc::new(MockApi::default());
        let sink = Arc::new(MockSink::default());
        let config = QueueConfig {
            max_size: 1,
            ..QueueConfig::default()
        };
        let queue = OfflineQueue::new(config, api, sink);
        queue.queue_action(edit("m_1", "x")).await.unwrap();
        assert!(matches!(
            queue.queue_action(edit("m_2", "y")).await,
            Err(QueueError::Full { max_size: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_replay_after_settle() {
        let (queue, api, sink) = setup(MockApi::default(), MockSink::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        queue.start(state_rx);

        queue.queue_action(edit("m_1", "offline edit")).await.unwrap();

        sink.set_connected(true);
        state_tx.send_replace(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(api.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(api.calls(), vec!["edit:m_1:offline edit"]);
        assert_eq!(sink.names(), vec!["message-updated"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_before_driver_first_runs_still_replays() {
        let (queue, api, sink) = setup(MockApi::default(), MockSink::default());
        queue.queue_action(edit("m_1", "x")).await.unwrap();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Reconnecting);

        // No yield between start and the transition.
        queue.start(state_rx);
        sink.set_connected(true);
        state_tx.send_replace(ConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(api.calls(), vec!["edit:m_1:x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_action_is_not_retried() {
        let (queue, api, _sink) = setup(MockApi::rejecting(), MockSink::connected());
        let mut notices = queue.subscribe();

        queue.queue_action(edit("m_1", "x")).await.unwrap();
        queue.process_queue().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(api.calls().len(), 1);
        match drain(&mut notices).as_slice() {
            [QueueNotice::Deferred { .. }, QueueNotice::PermanentFailure { error, .. }] => {
                assert!(!error.is_transient());
            }
            other => panic!("Unexpected notices {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_action_requeued_after_pass_requests_another() {
        let (queue, _api, sink) = setup(MockApi::default(), MockSink::connected());
        assert!(!queue.needs_another_pass().await);

        // A retry put its action back but lost the race for the pass flag
        // before raising `rerun`.
        queue.actions.lock().await.enqueue(edit("m_1", "x")).unwrap();
        assert!(queue.needs_another_pass().await);

        sink.set_connected(false);
        assert!(!queue.needs_another_pass().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_trigger_is_picked_up_by_running_pass() {
        let (queue, api, _sink) = setup(MockApi::default(), MockSink::connected());
        queue.queue_action(edit("m_1", "x")).await.unwrap();

        // Another caller holds the flag, so this trigger only raises `rerun`.
        queue.processing.store(true, Ordering::Release);
        queue.process_queue().await;
        assert!(api.calls().is_empty());

        // The holder finishes; its follow-up check finds the raised flag.
        queue.processing.store(false, Ordering::Release);
        assert!(queue.needs_another_pass().await);
        queue.process_queue().await;
        assert_eq!(api.calls(), vec!["edit:m_1:x"]);
    }
}
