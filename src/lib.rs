//! Transactional outbox relay.
//!
//! Producers write [`model::OutboxMessage`]s through a [`store::OutboxStore`]
//! inside their own unit of work; [`worker::OutboxWorker`]s lease them in
//! batches and hand them to a [`dispatch::OutboxDispatcher`], giving
//! at-least-once delivery across crashes and competing workers.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod model;
pub mod store;
pub mod worker;

pub use dispatch::{DispatchOutcome, OutboxDispatcher};
pub use model::{MessageStatus, OutboxMessage};
pub use store::{OutboxStore, StoreError};
pub use worker::{OutboxWorker, WorkerGroup};
