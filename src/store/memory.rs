//! In-process outbox store.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every operation,
//! reservation included, is a single critical section over the whole set.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{lease_deadline, OutboxStore, StoreError};
use crate::model::{MessageStatus, OutboxMessage};

#[derive(Default)]
struct State {
    messages: HashMap<Uuid, OutboxMessage>,
    /// Enqueue order, used to break ties between equal `occurred_on`.
    order: Vec<Uuid>,
}

#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<OutboxMessage> {
        self.state.lock().await.messages.get(&id).cloned()
    }

    /// All messages in enqueue order.
    pub async fn snapshot(&self) -> Vec<OutboxMessage> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    #[instrument(skip_all, fields(message_id = %message.id))]
    async fn enqueue(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        if message.status != MessageStatus::Pending {
            return Err(StoreError::NotPending(message.id));
        }
        let mut state = self.state.lock().await;
        if state.messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        state.order.push(message.id);
        state.messages.insert(message.id, message.clone());
        Ok(())
    }

    #[instrument(skip_all, fields(batch_size = batch_size))]
    async fn reserve_batch(
        &self,
        batch_size: usize,
        lease_time: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let now = Utc::now();
        let lease_until = lease_deadline(now, lease_time)?;
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let State { messages, order } = &mut *state;

        let mut eligible: Vec<(usize, Uuid)> = order
            .iter()
            .enumerate()
            .filter(|(_, id)| {
                messages.get(*id).is_some_and(|m| {
                    m.status == MessageStatus::Pending || m.lease_expired(now)
                })
            })
            .map(|(pos, id)| (pos, *id))
            .collect();
        eligible.sort_by_key(|(pos, id)| (messages[id].occurred_on, *pos));
        eligible.truncate(batch_size);

        let mut batch = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(msg) = messages.get_mut(&id) {
                msg.status = MessageStatus::Reserved;
                msg.lease_expires_at = Some(lease_until);
                msg.attempt_count += 1;
                batch.push(msg.clone());
            }
        }
        debug!(count = batch.len(), "reserved outbox batch");
        Ok(batch)
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn mark_as_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let msg = state.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match msg.status {
            MessageStatus::Reserved => {
                msg.status = MessageStatus::Processed;
                msg.processed_on = Some(Utc::now());
                msg.lease_expires_at = None;
                Ok(())
            }
            MessageStatus::Processed => Ok(()),
            from => Err(StoreError::InvalidTransition {
                id,
                from,
                to: MessageStatus::Processed,
            }),
        }
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let msg = state.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match msg.status {
            MessageStatus::Reserved => {
                msg.status = MessageStatus::Failed;
                msg.error = Some(error.to_string());
                msg.lease_expires_at = None;
                Ok(())
            }
            MessageStatus::Failed => Ok(()),
            from => Err(StoreError::InvalidTransition {
                id,
                from,
                to: MessageStatus::Failed,
            }),
        }
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn release_lease(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let msg = state.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if msg.status == MessageStatus::Reserved {
            msg.status = MessageStatus::Pending;
            msg.lease_expires_at = None;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn release_expired_leases(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut released = 0;
        for msg in state.messages.values_mut() {
            if msg.lease_expired(now) {
                msg.status = MessageStatus::Pending;
                msg.lease_expires_at = None;
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "released expired leases");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_skips_terminal_and_leased_messages() {
        let store = InMemoryOutboxStore::new();
        let a = OutboxMessage::new("a", "1");
        let b = OutboxMessage::new("b", "2");
        let c = OutboxMessage::new("c", "3");
        for m in [&a, &b, &c] {
            store.enqueue(m).await.unwrap();
        }

        let first = store.reserve_batch(2, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 2);
        store.mark_as_processed(first[0].id).await.unwrap();

        let second = store.reserve_batch(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, c.id);

        let third = store.reserve_batch(10, Duration::from_secs(30)).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn batch_follows_occurrence_order() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let late = OutboxMessage::new("late", "").with_occurred_on(now);
        let early = OutboxMessage::new("early", "")
            .with_occurred_on(now - chrono::Duration::minutes(1));
        store.enqueue(&late).await.unwrap();
        store.enqueue(&early).await.unwrap();

        let batch = store.reserve_batch(2, Duration::from_secs(30)).await.unwrap();
        let types: Vec<_> = batch.iter().map(|m| m.message_type.as_str()).collect();
        assert_eq!(types, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicates_and_non_pending() {
        let store = InMemoryOutboxStore::new();
        let msg = OutboxMessage::new("t", "p");
        store.enqueue(&msg).await.unwrap();
        assert!(matches!(
            store.enqueue(&msg).await,
            Err(StoreError::Duplicate(id)) if id == msg.id
        ));

        let mut reserved = OutboxMessage::new("t", "p");
        reserved.status = MessageStatus::Reserved;
        assert!(matches!(
            store.enqueue(&reserved).await,
            Err(StoreError::NotPending(_))
        ));
    }
}
