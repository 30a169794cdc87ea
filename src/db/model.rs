//! Row models for the `outbox_messages` table.
//!
//! Keep these structs focused on the data returned by queries. Conversion
//! into domain types happens here so repositories stay SQL-only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{MessageStatus, OutboxMessage};
use crate::store::StoreError;

/// Raw row as stored; timestamps are epoch milliseconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub seq: i64,
    pub id: String,
    pub occurred_on_ms: i64,
    pub message_type: String,
    pub payload: String,
    pub correlation_id: String,
    pub causation_id: String,
    pub status: String,
    pub processed_on_ms: Option<i64>,
    pub error: Option<String>,
    pub attempt_count: i64,
    pub lease_expires_at_ms: Option<i64>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|err| StoreError::Corrupt(format!("id {:?}: {err}", row.id)))?;
        let status = MessageStatus::parse_status(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {:?} for {id}", row.status)))?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| StoreError::Corrupt(format!("attempt_count {} for {id}", row.attempt_count)))?;
        Ok(OutboxMessage {
            id,
            occurred_on: ms_to_dt(row.occurred_on_ms)?,
            message_type: row.message_type,
            payload: row.payload,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            status,
            processed_on: row.processed_on_ms.map(ms_to_dt).transpose()?,
            error: row.error,
            attempt_count,
            lease_expires_at: row.lease_expires_at_ms.map(ms_to_dt).transpose()?,
        })
    }
}

/// Number of messages per status, as shown by the admin tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub reserved: i64,
    pub processed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.reserved + self.processed + self.failed
    }
}

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}
