//! Outbox store contract.
//!
//! A store persists [`OutboxMessage`]s and owns every status transition.
//! Workers coordinate only through it: `reserve_batch` must hand each
//! eligible message to at most one caller, even when many workers poll the
//! same backend at once.
//!
//! Implementations:
//! - `memory`: mutex-guarded in-process store (tests, embedding).
//! - `crate::db::SqliteOutboxStore`: SQLite via sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{MessageStatus, OutboxMessage};

pub mod memory;

pub use memory::InMemoryOutboxStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("outbox message {0} not found")]
    NotFound(Uuid),
    #[error("outbox message {0} already exists")]
    Duplicate(Uuid),
    #[error("outbox message {0} must be pending to be enqueued")]
    NotPending(Uuid),
    #[error("outbox message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("invalid lease duration: {0}")]
    InvalidLease(String),
    #[error("corrupt outbox row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new `Pending` message.
    async fn enqueue(&self, message: &OutboxMessage) -> Result<(), StoreError>;

    /// Atomically lease up to `batch_size` messages that are `Pending` or
    /// whose lease has expired. Each returned message is `Reserved` with a
    /// lease ending `lease_time` from now and an incremented attempt count.
    async fn reserve_batch(
        &self,
        batch_size: usize,
        lease_time: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// `Reserved -> Processed`. A second call on a processed message is a no-op.
    async fn mark_as_processed(&self, id: Uuid) -> Result<(), StoreError>;

    /// `Reserved -> Failed`, recording `error`. Repeating it is a no-op.
    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// `Reserved -> Pending` without touching the attempt count.
    async fn release_lease(&self, id: Uuid) -> Result<(), StoreError>;

    /// Return every reserved message with a lapsed lease to `Pending`.
    /// Yields the number of leases reclaimed.
    async fn release_expired_leases(&self) -> Result<u64, StoreError>;
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::backend(err)
    }
}

/// When a lease taken at `now` for `lease_time` runs out.
pub(crate) fn lease_deadline(
    now: DateTime<Utc>,
    lease_time: Duration,
) -> Result<DateTime<Utc>, StoreError> {
    let lease = chrono::Duration::from_std(lease_time)
        .map_err(|err| StoreError::InvalidLease(err.to_string()))?;
    now.checked_add_signed(lease)
        .ok_or_else(|| StoreError::InvalidLease(format!("{lease_time:?} from {now} is out of range")))
}
