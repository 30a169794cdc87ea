#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use outbox_relay::db::{self, SqliteOutboxStore};
use outbox_relay::store::InMemoryOutboxStore;
use outbox_relay::{DispatchOutcome, OutboxDispatcher, OutboxMessage, OutboxStore};

/// Store plus a way to read a message back, whatever the backend.
#[async_trait]
pub trait Inspect: OutboxStore + Clone + 'static {
    async fn fetch(&self, id: Uuid) -> OutboxMessage;
}

#[async_trait]
impl Inspect for InMemoryOutboxStore {
    async fn fetch(&self, id: Uuid) -> OutboxMessage {
        self.get(id).await.expect("message exists")
    }
}

#[async_trait]
impl Inspect for SqliteOutboxStore {
    async fn fetch(&self, id: Uuid) -> OutboxMessage {
        self.get(id).await.unwrap().expect("message exists")
    }
}

pub async fn memory_store() -> (Option<tempfile::TempDir>, InMemoryOutboxStore) {
    (None, InMemoryOutboxStore::new())
}

/// File-backed so every pooled connection sees the same database.
pub async fn sqlite_store() -> (Option<tempfile::TempDir>, SqliteOutboxStore) {
    let td = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", td.path().join("outbox.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (Some(td), SqliteOutboxStore::new(pool))
}

pub async fn enqueue_new<S: OutboxStore>(store: &S, message_type: &str) -> OutboxMessage {
    let msg = OutboxMessage::new(message_type, format!(r#"{{"type":"{message_type}"}}"#));
    store.enqueue(&msg).await.unwrap();
    msg
}

#[derive(Debug, Clone)]
pub enum Reply {
    Deliver,
    Reject(&'static str),
    Fault(&'static str),
}

/// Replies per message type (default: deliver) and records every call.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    replies: Arc<HashMap<String, Reply>>,
    calls: Arc<Mutex<Vec<Uuid>>>,
}

impl RecordingDispatcher {
    pub fn with_replies(replies: Vec<(&str, Reply)>) -> Self {
        Self {
            replies: Arc::new(
                replies
                    .into_iter()
                    .map(|(t, r)| (t.to_string(), r))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl OutboxDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: &OutboxMessage) -> Result<DispatchOutcome> {
        self.calls.lock().await.push(message.id);
        match self.replies.get(&message.message_type) {
            None | Some(Reply::Deliver) => Ok(DispatchOutcome::Delivered),
            Some(Reply::Reject(reason)) => Ok(DispatchOutcome::Rejected(reason.to_string())),
            Some(Reply::Fault(reason)) => Err(anyhow!(*reason)),
        }
    }
}
