//! Polling outbox worker.
//!
//! Each cycle reclaims expired leases, reserves a batch and dispatches the
//! batch one message at a time, recording every outcome in the store. All
//! coordination between workers goes through the store, so any number of
//! [`OutboxWorker`]s may poll the same backend.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WorkerOptions;
use crate::dispatch::{DispatchOutcome, OutboxDispatcher};
use crate::model::OutboxMessage;
use crate::store::OutboxStore;

/// What one poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was leasable.
    Idle,
    /// The store refused the reservation; nothing was processed.
    ReserveFailed,
    Batch(BatchReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub reserved: usize,
    pub processed: usize,
    pub failed: usize,
    pub released: usize,
    /// Outcome known but the store call recording it failed.
    pub unrecorded: usize,
    /// Cancellation stopped the batch early; the rest stay leased.
    pub interrupted: bool,
}

impl BatchReport {
    /// Some message was handed back or left leased after a fault, so the
    /// downstream is likely struggling.
    pub fn had_faults(&self) -> bool {
        self.released > 0 || self.unrecorded > 0
    }
}

/// Final state of one message from this worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Processed,
    Failed,
    Released,
    Unrecorded,
}

pub struct OutboxWorker {
    instance_id: Uuid,
    store: Arc<dyn OutboxStore>,
    dispatcher: Arc<dyn OutboxDispatcher>,
    options: WorkerOptions,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        dispatcher: Arc<dyn OutboxDispatcher>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            store,
            dispatcher,
            options,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Poll until `shutdown` turns `true` or its sender is dropped.
    ///
    /// A clean batch is followed by the next cycle at once; a batch with
    /// faults, an idle poll or a failed reservation waits `poll_interval`.
    /// Store and dispatch failures never end the loop. A dispatch already in
    /// flight finishes before shutdown is honored.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.instance_id, "outbox worker started");
        while !stop_requested(&shutdown) {
            let cycle = AssertUnwindSafe(self.run_cycle(&shutdown))
                .catch_unwind()
                .await;
            let pause = match cycle {
                // Released messages are pending again at once; space out their retries.
                Ok(CycleOutcome::Batch(report)) if report.had_faults() => {
                    Some(self.options.poll_interval())
                }
                Ok(CycleOutcome::Batch(_)) => None,
                Ok(CycleOutcome::Idle) | Ok(CycleOutcome::ReserveFailed) => {
                    Some(self.options.poll_interval())
                }
                Err(panic) => {
                    error!(
                        worker = %self.instance_id,
                        panic = %panic_message(panic.as_ref()),
                        "outbox cycle failed; backing off"
                    );
                    Some(self.options.recovery_delay())
                }
            };
            if let Some(pause) = pause {
                if !wait_or_shutdown(pause, &mut shutdown).await {
                    break;
                }
            }
        }
        info!(worker = %self.instance_id, "outbox worker stopped");
    }

    /// One poll cycle: reclaim expired leases, reserve, dispatch.
    #[instrument(skip_all, fields(worker = %self.instance_id))]
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        // Best effort; whatever is missed now is reclaimed next cycle.
        match self.store.release_expired_leases().await {
            Ok(0) => {}
            Ok(released) => info!(released, "reclaimed expired leases"),
            Err(err) => error!(?err, "failed to release expired leases"),
        }

        let batch = match self
            .store
            .reserve_batch(self.options.max_batch_size, self.options.lease_duration())
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                error!(?err, "failed to reserve outbox batch");
                return CycleOutcome::ReserveFailed;
            }
        };

        if batch.is_empty() {
            debug!("no outbox messages to process");
            return CycleOutcome::Idle;
        }
        info!(count = batch.len(), "reserved outbox messages");

        let mut report = BatchReport {
            reserved: batch.len(),
            ..Default::default()
        };
        for (idx, message) in batch.iter().enumerate() {
            if stop_requested(shutdown) {
                info!(
                    remaining = batch.len() - idx,
                    "cancellation requested; leaving remaining messages leased"
                );
                report.interrupted = true;
                break;
            }
            match self.process(message).await {
                Settled::Processed => report.processed += 1,
                Settled::Failed => report.failed += 1,
                Settled::Released => report.released += 1,
                Settled::Unrecorded => report.unrecorded += 1,
            }
        }
        CycleOutcome::Batch(report)
    }

    /// Dispatch one reserved message and record the outcome. Nothing raised
    /// here reaches the rest of the batch.
    async fn process(&self, message: &OutboxMessage) -> Settled {
        let budget = self.options.max_retry_count;
        if budget > 0 && message.attempt_count > budget {
            // Reclaimed after expiry more often than the budget allows.
            let reason = format!(
                "retry budget exhausted after {} attempts",
                message.attempt_count - 1
            );
            warn!(message_id = %message.id, attempt = message.attempt_count, "{reason}");
            return self.record_failure(message, &reason).await;
        }

        let attempt = AssertUnwindSafe(self.dispatcher.dispatch(message))
            .catch_unwind()
            .await;
        match attempt {
            Ok(Ok(DispatchOutcome::Delivered)) => {
                match self.store.mark_as_processed(message.id).await {
                    Ok(()) => {
                        debug!(message_id = %message.id, "outbox message processed");
                        Settled::Processed
                    }
                    Err(err) => {
                        error!(?err, message_id = %message.id, "failed to mark outbox message as processed");
                        Settled::Unrecorded
                    }
                }
            }
            Ok(Ok(DispatchOutcome::Rejected(reason))) => {
                warn!(
                    message_id = %message.id,
                    attempt = message.attempt_count,
                    %reason,
                    "outbox message rejected"
                );
                self.record_failure(message, &reason).await
            }
            Ok(Err(err)) => self.handle_fault(message, format!("{err:#}")).await,
            Err(panic) => {
                self.handle_fault(message, panic_message(panic.as_ref()))
                    .await
            }
        }
    }

    /// The dispatcher broke down for this attempt: give the message back
    /// unless it has used up its attempts.
    async fn handle_fault(&self, message: &OutboxMessage, fault: String) -> Settled {
        error!(
            message_id = %message.id,
            attempt = message.attempt_count,
            %fault,
            "failed to process outbox message"
        );
        let budget = self.options.max_retry_count;
        if budget > 0 && message.attempt_count >= budget {
            let reason = format!(
                "retry budget exhausted after {} attempts: {fault}",
                message.attempt_count
            );
            return self.record_failure(message, &reason).await;
        }
        match self.store.release_lease(message.id).await {
            Ok(()) => Settled::Released,
            Err(err) => {
                error!(?err, message_id = %message.id, "failed to release lease");
                Settled::Unrecorded
            }
        }
    }

    async fn record_failure(&self, message: &OutboxMessage, reason: &str) -> Settled {
        match self.store.mark_as_failed(message.id, reason).await {
            Ok(()) => Settled::Failed,
            Err(err) => {
                error!(?err, message_id = %message.id, "failed to mark outbox message as failed");
                Settled::Unrecorded
            }
        }
    }
}

/// A set of workers sharing one store and one dispatcher.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `options.instances` workers on the current runtime.
    pub fn spawn(
        store: Arc<dyn OutboxStore>,
        dispatcher: Arc<dyn OutboxDispatcher>,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = (0..options.instances.max(1))
            .map(|_| {
                let worker = OutboxWorker::new(
                    Arc::clone(&store),
                    Arc::clone(&dispatcher),
                    options.clone(),
                );
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(rx).await })
            })
            .collect();
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Ask every worker to stop after its current message.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(?err, "outbox worker task ended abnormally");
            }
        }
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay` unless shutdown arrives first. Returns whether to keep running.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageStatus;
    use crate::store::{InMemoryOutboxStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Delegates to an in-memory store while counting reservations and
    /// optionally failing or panicking on them.
    #[derive(Clone, Default)]
    struct ProbeStore {
        inner: InMemoryOutboxStore,
        reserve_calls: Arc<AtomicUsize>,
        fail_reserve: Arc<AtomicBool>,
        panic_reserve: Arc<AtomicBool>,
        fail_release_expired: Arc<AtomicBool>,
    }

    #[async_trait]
    impl OutboxStore for ProbeStore {
        async fn enqueue(&self, message: &OutboxMessage) -> Result<(), StoreError> {
            self.inner.enqueue(message).await
        }

        async fn reserve_batch(
            &self,
            batch_size: usize,
            lease_time: Duration,
        ) -> Result<Vec<OutboxMessage>, StoreError> {
            self.reserve_calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_reserve.load(Ordering::SeqCst) {
                panic!("store exploded");
            }
            if self.fail_reserve.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt("unreachable".into()));
            }
            self.inner.reserve_batch(batch_size, lease_time).await
        }

        async fn mark_as_processed(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.mark_as_processed(id).await
        }

        async fn mark_as_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
            self.inner.mark_as_failed(id, error).await
        }

        async fn release_lease(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.release_lease(id).await
        }

        async fn release_expired_leases(&self) -> Result<u64, StoreError> {
            if self.fail_release_expired.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt("lease scan failed".into()));
            }
            self.inner.release_expired_leases().await
        }
    }

    /// Scripted by message type: "ok", "reject", "fault", "panic", "stop".
    #[derive(Clone, Default)]
    struct ScriptedDispatcher {
        calls: Arc<Mutex<Vec<String>>>,
        stop: Option<Arc<watch::Sender<bool>>>,
    }

    #[async_trait]
    impl OutboxDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, message: &OutboxMessage) -> anyhow::Result<DispatchOutcome> {
            self.calls.lock().await.push(message.message_type.clone());
            match message.message_type.as_str() {
                "reject" => Ok(DispatchOutcome::Rejected("downstream 500".into())),
                "fault" => Err(anyhow::anyhow!("transport down")),
                "panic" => panic!("dispatcher bug"),
                "stop" => {
                    if let Some(tx) = &self.stop {
                        let _ = tx.send(true);
                    }
                    Ok(DispatchOutcome::Delivered)
                }
                _ => Ok(DispatchOutcome::Delivered),
            }
        }
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            instances: 1,
            poll_interval_ms: 50,
            max_batch_size: 10,
            lease_duration_ms: 30_000,
            max_retry_count: 5,
            recovery_delay_ms: 50,
        }
    }

    async fn enqueue_all(store: &ProbeStore, types: &[&str]) -> Vec<OutboxMessage> {
        let mut out = Vec::new();
        for t in types {
            let msg = OutboxMessage::new(*t, "{}");
            store.enqueue(&msg).await.unwrap();
            out.push(msg);
        }
        out
    }

    fn worker(
        store: &ProbeStore,
        dispatcher: ScriptedDispatcher,
        options: WorkerOptions,
    ) -> OutboxWorker {
        OutboxWorker::new(Arc::new(store.clone()), Arc::new(dispatcher), options)
    }

    #[tokio::test]
    async fn panic_in_dispatch_releases_only_that_message() {
        let store = ProbeStore::default();
        let msgs = enqueue_all(&store, &["ok", "panic", "reject"]).await;
        let w = worker(&store, ScriptedDispatcher::default(), fast_options());
        let (_tx, rx) = watch::channel(false);

        let outcome = w.run_cycle(&rx).await;
        assert_eq!(
            outcome,
            CycleOutcome::Batch(BatchReport {
                reserved: 3,
                processed: 1,
                failed: 1,
                released: 1,
                ..Default::default()
            })
        );
        let panicked = store.inner.get(msgs[1].id).await.unwrap();
        assert_eq!(panicked.status, MessageStatus::Pending);
        assert_eq!(panicked.attempt_count, 1);
        assert!(panicked.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn expired_lease_failure_does_not_abort_cycle() {
        let store = ProbeStore::default();
        store.fail_release_expired.store(true, Ordering::SeqCst);
        let msgs = enqueue_all(&store, &["ok"]).await;
        let w = worker(&store, ScriptedDispatcher::default(), fast_options());
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(w.run_cycle(&rx).await, CycleOutcome::Batch(_)));
        let msg = store.inner.get(msgs[0].id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Processed);
    }

    #[tokio::test]
    async fn reserve_failure_is_reported() {
        let store = ProbeStore::default();
        store.fail_reserve.store(true, Ordering::SeqCst);
        enqueue_all(&store, &["ok"]).await;
        let w = worker(&store, ScriptedDispatcher::default(), fast_options());
        let (_tx, rx) = watch::channel(false);
        assert_eq!(w.run_cycle(&rx).await, CycleOutcome::ReserveFailed);
    }

    #[tokio::test]
    async fn cancellation_mid_batch_leaves_rest_reserved() {
        let store = ProbeStore::default();
        let msgs = enqueue_all(&store, &["stop", "ok", "ok"]).await;
        let (tx, rx) = watch::channel(false);
        let dispatcher = ScriptedDispatcher {
            stop: Some(Arc::new(tx)),
            ..Default::default()
        };
        let calls = Arc::clone(&dispatcher.calls);
        let w = worker(&store, dispatcher, fast_options());

        let outcome = w.run_cycle(&rx).await;
        assert_eq!(
            outcome,
            CycleOutcome::Batch(BatchReport {
                reserved: 3,
                processed: 1,
                interrupted: true,
                ..Default::default()
            })
        );
        assert_eq!(calls.lock().await.len(), 1);
        for m in &msgs[1..] {
            let m = store.inner.get(m.id).await.unwrap();
            assert_eq!(m.status, MessageStatus::Reserved);
        }
    }

    #[tokio::test]
    async fn fault_on_last_allowed_attempt_fails_message() {
        let store = ProbeStore::default();
        let msgs = enqueue_all(&store, &["fault"]).await;
        let options = WorkerOptions {
            max_retry_count: 2,
            ..fast_options()
        };
        let w = worker(&store, ScriptedDispatcher::default(), options);
        let (_tx, rx) = watch::channel(false);

        // First attempt: released for another try.
        w.run_cycle(&rx).await;
        let m = store.inner.get(msgs[0].id).await.unwrap();
        assert_eq!(m.status, MessageStatus::Pending);
        assert_eq!(m.attempt_count, 1);

        // Second attempt uses up the budget.
        w.run_cycle(&rx).await;
        let m = store.inner.get(msgs[0].id).await.unwrap();
        assert_eq!(m.status, MessageStatus::Failed);
        assert_eq!(m.attempt_count, 2);
        let error = m.error.unwrap();
        assert!(error.starts_with("retry budget exhausted after 2 attempts"), "{error}");
        assert!(error.contains("transport down"), "{error}");
    }

    #[tokio::test]
    async fn zero_budget_keeps_retrying_faults() {
        let store = ProbeStore::default();
        let msgs = enqueue_all(&store, &["fault"]).await;
        let options = WorkerOptions {
            max_retry_count: 0,
            ..fast_options()
        };
        let w = worker(&store, ScriptedDispatcher::default(), options);
        let (_tx, rx) = watch::channel(false);
        for _ in 0..4 {
            w.run_cycle(&rx).await;
        }
        let m = store.inner.get(msgs[0].id).await.unwrap();
        assert_eq!(m.status, MessageStatus::Pending);
        assert_eq!(m.attempt_count, 4);
    }

    #[tokio::test]
    async fn reclaimed_message_over_budget_is_failed_without_dispatch() {
        let store = ProbeStore::default();
        let msgs = enqueue_all(&store, &["ok"]).await;
        // Simulate a worker crashing twice while holding the lease.
        for _ in 0..2 {
            store
                .inner
                .reserve_batch(10, Duration::from_millis(1))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            store.inner.release_expired_leases().await.unwrap();
        }
        let options = WorkerOptions {
            max_retry_count: 2,
            ..fast_options()
        };
        let dispatcher = ScriptedDispatcher::default();
        let calls = Arc::clone(&dispatcher.calls);
        let w = worker(&store, dispatcher, options);
        let (_tx, rx) = watch::channel(false);

        w.run_cycle(&rx).await;
        let m = store.inner.get(msgs[0].id).await.unwrap();
        assert_eq!(m.status, MessageStatus::Failed);
        assert_eq!(m.attempt_count, 3);
        assert!(calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn idle_worker_waits_poll_interval_between_reservations() {
        let store = ProbeStore::default();
        let options = WorkerOptions {
            poll_interval_ms: 100,
            recovery_delay_ms: 100,
            ..fast_options()
        };
        let w = worker(&store, ScriptedDispatcher::default(), options);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let calls = store.reserve_calls.load(Ordering::SeqCst);
        assert!((2..=6).contains(&calls), "reserve called {calls} times");
    }

    /// Records when each dispatch started and always faults.
    #[derive(Clone, Default)]
    struct OutageDispatcher {
        started: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    #[async_trait]
    impl OutboxDispatcher for OutageDispatcher {
        async fn dispatch(&self, _message: &OutboxMessage) -> anyhow::Result<DispatchOutcome> {
            self.started.lock().await.push(tokio::time::Instant::now());
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn fault_retries_wait_for_the_poll_interval() {
        let store = ProbeStore::default();
        let msgs = enqueue_all(&store, &["flaky"]).await;
        let options = WorkerOptions {
            poll_interval_ms: 100,
            recovery_delay_ms: 100,
            ..WorkerOptions::default()
        };
        let dispatcher = OutageDispatcher::default();
        let started = Arc::clone(&dispatcher.started);
        let w = OutboxWorker::new(Arc::new(store.clone()), Arc::new(dispatcher), options);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let started = started.lock().await.clone();
        assert!((2..=3).contains(&started.len()), "{} dispatches", started.len());
        for pair in started.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        // A short outage stays well inside the default retry budget.
        let m = store.inner.get(msgs[0].id).await.unwrap();
        assert_eq!(m.status, MessageStatus::Pending);
        assert_eq!(m.attempt_count as usize, started.len());
    }

    #[tokio::test]
    async fn panicking_store_does_not_stop_the_loop() {
        let store = ProbeStore::default();
        store.panic_reserve.store(true, Ordering::SeqCst);
        let w = worker(&store, ScriptedDispatcher::default(), fast_options());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.reserve_calls.load(Ordering::SeqCst) >= 2);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_idle_wait() {
        let store = ProbeStore::default();
        let options = WorkerOptions {
            poll_interval_ms: 60_000,
            recovery_delay_ms: 60_000,
            ..fast_options()
        };
        let w = worker(&store, ScriptedDispatcher::default(), options);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_stops_worker() {
        let store = ProbeStore::default();
        let w = worker(&store, ScriptedDispatcher::default(), fast_options());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop once the sender is gone")
            .unwrap();
    }

    #[test]
    fn panic_payloads_are_readable() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(owned.as_ref()), "boom");
        let borrowed: Box<dyn Any + Send> = Box::new("bang");
        assert_eq!(panic_message(borrowed.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
