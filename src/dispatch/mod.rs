//! Delivery of outbox messages to the outside world.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::model::OutboxMessage;

pub mod webhook;

pub use webhook::WebhookDispatcher;

/// Result of a dispatch the downstream actually answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Downstream refused the message; the reason is stored on the message.
    Rejected(String),
}

/// Hands one message to an external system.
///
/// Ordinary delivery failures come back as [`DispatchOutcome::Rejected`].
/// `Err` (or a panic) means the attempt itself broke down: the worker
/// releases the lease instead of failing the message.
#[async_trait]
pub trait OutboxDispatcher: Send + Sync {
    async fn dispatch(&self, message: &OutboxMessage) -> Result<DispatchOutcome>;
}

/// Dry-run dispatcher: logs the message and reports it delivered.
#[derive(Debug, Clone, Default)]
pub struct LogDispatcher;

#[async_trait]
impl OutboxDispatcher for LogDispatcher {
    async fn dispatch(&self, message: &OutboxMessage) -> Result<DispatchOutcome> {
        info!(
            message_id = %message.id,
            message_type = %message.message_type,
            correlation_id = %message.correlation_id,
            attempt = message.attempt_count,
            payload_len = message.payload.len(),
            "dispatching outbox message (log only)"
        );
        Ok(DispatchOutcome::Delivered)
    }
}
