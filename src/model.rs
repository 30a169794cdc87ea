use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Reserved,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Reserved => "reserved",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "reserved" => Some(MessageStatus::Reserved),
            "processed" => Some(MessageStatus::Processed),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Processed and Failed messages are never reserved again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Processed | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable unit of outbound work.
///
/// Producer code builds it with [`OutboxMessage::new`] and hands it to a
/// store. The processing fields below the payload are owned by the store;
/// the worker only reads them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub occurred_on: DateTime<Utc>,
    pub message_type: String,
    pub payload: String,
    pub correlation_id: String,
    pub causation_id: String,

    pub status: MessageStatus,
    pub processed_on: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempt_count: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(message_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_on: Utc::now().trunc_subsecs(3),
            message_type: message_type.into(),
            payload: payload.into(),
            correlation_id: String::new(),
            causation_id: String::new(),
            status: MessageStatus::Pending,
            processed_on: None,
            error: None,
            attempt_count: 0,
            lease_expires_at: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = causation_id.into();
        self
    }

    /// Stores keep millisecond precision, so `occurred_on` is truncated to it.
    pub fn with_occurred_on(mut self, occurred_on: DateTime<Utc>) -> Self {
        self.occurred_on = occurred_on.trunc_subsecs(3);
        self
    }

    /// True when the message is `Reserved` and its lease has passed `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Reserved
            && self.lease_expires_at.map_or(true, |until| until <= now)
    }
}
