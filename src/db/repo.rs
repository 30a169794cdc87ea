use super::model::{dt_to_ms, OutboxRow, StatusCounts};
use crate::model::{MessageStatus, OutboxMessage};
use crate::store::{lease_deadline, OutboxStore, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

pub type Pool = SqlitePool;

const COLUMNS: &str = "seq, id, occurred_on_ms, message_type, payload, correlation_id, \
    causation_id, status, processed_on_ms, error, attempt_count, lease_expires_at_ms";

/// Messages a worker may lease: pending ones and reserved ones whose lease has lapsed.
/// `?2` is the current time in epoch milliseconds.
const ELIGIBLE: &str = "(status = 'pending' OR (status = 'reserved' \
    AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?2)))";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus full sync; the busy timeout lets concurrent writers queue up.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("failed to open outbox database")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert an outbox row inside the caller's transaction, so business state
/// and the outgoing message commit or roll back together.
#[instrument(skip_all, fields(message_id = %message.id))]
pub async fn enqueue_tx(
    tx: &mut Transaction<'_, Sqlite>,
    message: &OutboxMessage,
) -> Result<(), StoreError> {
    if message.status != MessageStatus::Pending {
        return Err(StoreError::NotPending(message.id));
    }
    let res = sqlx::query(
        "INSERT INTO outbox_messages \
         (id, occurred_on_ms, message_type, payload, correlation_id, causation_id, status, attempt_count) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(message.id.to_string())
    .bind(dt_to_ms(message.occurred_on))
    .bind(&message.message_type)
    .bind(&message.payload)
    .bind(&message.correlation_id)
    .bind(&message.causation_id)
    .bind(i64::from(message.attempt_count))
    .execute(&mut **tx)
    .await;
    match res {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::Duplicate(message.id))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteOutboxStore {
    pool: Pool,
}

impl SqliteOutboxStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all, fields(message_id = %id))]
    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = ?");
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxMessage::try_from).transpose()
    }

    #[instrument(skip_all)]
    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match MessageStatus::parse_status(&status) {
                Some(MessageStatus::Pending) => counts.pending = n,
                Some(MessageStatus::Reserved) => counts.reserved = n,
                Some(MessageStatus::Processed) => counts.processed = n,
                Some(MessageStatus::Failed) => counts.failed = n,
                None => return Err(StoreError::Corrupt(format!("status {status:?}"))),
            }
        }
        Ok(counts)
    }

    async fn current_status(&self, id: Uuid) -> Result<MessageStatus, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM outbox_messages WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let status = status.ok_or(StoreError::NotFound(id))?;
        MessageStatus::parse_status(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {status:?} for {id}")))
    }

    /// Resolve a conditional update that matched no row: repeating the
    /// transition is fine, anything else is reported.
    async fn settle_miss(&self, id: Uuid, to: MessageStatus) -> Result<(), StoreError> {
        match self.current_status(id).await? {
            current if current == to => Ok(()),
            from => Err(StoreError::InvalidTransition { id, from, to }),
        }
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn enqueue(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        enqueue_tx(&mut tx, message).await?;
        tx.commit().await?;
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
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        // One statement: selection and the status flip happen under the same
        // write lock, so concurrent callers can never lease the same row.
        let sql = format!(
            "UPDATE outbox_messages \
             SET status = 'reserved', lease_expires_at_ms = ?1, attempt_count = attempt_count + 1 \
             WHERE seq IN (SELECT seq FROM outbox_messages WHERE {ELIGIBLE} \
                           ORDER BY occurred_on_ms ASC, seq ASC LIMIT ?3) \
               AND {ELIGIBLE} \
             RETURNING {COLUMNS}"
        );
        let mut rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(dt_to_ms(lease_until))
            .bind(dt_to_ms(now))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.sort_by_key(|r| (r.occurred_on_ms, r.seq));

        let batch = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = batch.len(), "reserved outbox batch");
        Ok(batch)
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn mark_as_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'processed', processed_on_ms = ?, lease_expires_at_ms = NULL \
             WHERE id = ? AND status = 'reserved'",
        )
        .bind(dt_to_ms(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return self.settle_miss(id, MessageStatus::Processed).await;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE outbox_messages \
             SET status = 'failed', error = ?, lease_expires_at_ms = NULL \
             WHERE id = ? AND status = 'reserved'",
        )
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return self.settle_miss(id, MessageStatus::Failed).await;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn release_lease(&self, id: Uuid) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE outbox_messages SET status = 'pending', lease_expires_at_ms = NULL \
             WHERE id = ? AND status = 'reserved'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            // Nothing leased; only an unknown id is an error.
            self.current_status(id).await?;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn release_expired_leases(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "UPDATE outbox_messages SET status = 'pending', lease_expires_at_ms = NULL \
             WHERE status = 'reserved' \
               AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?)",
        )
        .bind(dt_to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        let released = res.rows_affected();
        if released > 0 {
            debug!(released, "released expired leases");
        }
        Ok(released)
    }
}
