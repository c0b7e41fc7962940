//! In-memory ports for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::api::{ApiError, ClientError, EventSink, PersistedMessage, WriteApi};
use crate::protocol::{now_millis, ChatMessage, ClientEvent, MessageId, Reactions};

#[derive(Default)]
pub struct MockApi {
    pub calls: Mutex<Vec<String>>,
    fail_all: AtomicBool,
    reject_all: AtomicBool,
    fail_next: AtomicU32,
    next_id: AtomicU64,
}

impl MockApi {
    pub fn failing() -> Self {
        let api = Self::default();
        api.fail_all.store(true, Ordering::SeqCst);
        api
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn rejecting() -> Self {
        let api = Self::default();
        api.reject_all.store(true, Ordering::SeqCst);
        api
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(ApiError::Transient("down".into()));
        }
        if self.reject_all.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected("invalid".into()));
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiError::Transient("flaky".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WriteApi for MockApi {
    async fn create_message(&self, draft: &ChatMessage) -> Result<PersistedMessage, ApiError> {
        self.record(format!("create:{}", draft.content))?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PersistedMessage {
            id: MessageId::new(format!("m_{n}")),
            created_at: now_millis(),
        })
    }

    async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), ApiError> {
        self.record(format!("edit:{id}:{content}"))
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), ApiError> {
        self.record(format!("delete:{id}"))
    }

    async fn update_reactions(&self, id: &MessageId, _reactions: &Reactions) -> Result<(), ApiError> {
        self.record(format!("react:{id}"))
    }

    async fn mark_read(&self, id: &MessageId) -> Result<(), ApiError> {
        self.record(format!("read:{id}"))
    }
}

#[derive(Default)]
pub struct MockSink {
    connected: AtomicBool,
    pub emitted: Mutex<Vec<ClientEvent>>,
}

impl MockSink {
    pub fn connected() -> Self {
        let sink = Self::default();
        sink.set_connected(true);
        sink
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.emitted().iter().map(ClientEvent::name).collect()
    }
}

#[async_trait]
impl EventSink for MockSink {
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.emitted.lock().unwrap().push(event);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
