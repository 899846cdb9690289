//! The scheduler runtime (spec §4.3): a cooperative worker pool that
//! atomically claims entries, dispatches them through a transport, and
//! settles their fate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::OutboxConfig;
use crate::metrics::{MetricsSink, SettleOutcome};
use crate::retry::RetryPolicy;
use crate::store::OutboxStore;
use crate::transport::OutboxTransport;

/// Owns one store and one transport and runs the tick loop described in
/// spec §4.3.
///
/// Scheduling is single-threaded cooperative: the tick loop itself never
/// runs concurrently with itself, but per-entry processing is spawned as
/// independent tasks bounded by `concurrency`.
pub struct Scheduler {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn OutboxTransport>,
    metrics: Arc<dyn MetricsSink>,
    retry_policy: RetryPolicy,
    concurrency: usize,
    heartbeat: std::time::Duration,
    lock_timeout: chrono::Duration,

    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    in_flight: Arc<DashSet<String>>,
    kick: Arc<Notify>,
    idle: Arc<Notify>,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler in the stopped state. Call [`Scheduler::start`] (or
    /// rely on [`crate::Outbox::init`] with `auto_start`) to begin ticking.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn OutboxTransport>,
        metrics: Arc<dyn MetricsSink>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            store,
            transport,
            metrics,
            retry_policy: config.retry.clone(),
            concurrency: config.concurrency,
            heartbeat: config.heartbeat,
            lock_timeout: chrono::Duration::from_std(config.lock_timeout)
                .unwrap_or(chrono::Duration::minutes(5)),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(DashSet::new()),
            kick: Arc::new(Notify::new()),
            idle: Arc::new(Notify::new()),
            heartbeat_task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Idempotent; sets running=true, paused=false, starts the heartbeat
    /// task, and performs one immediate tick.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            self.tick().await;
            return;
        }
        self.paused.store(false, Ordering::Release);

        let scheduler = Arc::clone(self);
        let heartbeat = self.heartbeat;
        let kick = Arc::clone(&self.kick);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat) => {},
                    _ = kick.notified() => {},
                }
                if !scheduler.running.load(Ordering::Acquire) {
                    break;
                }
                scheduler.tick().await;
            }
        });
        *self.heartbeat_task.lock().expect("heartbeat task lock poisoned") = Some(handle);

        self.tick().await;
    }

    /// Cancel the heartbeat. In-flight entries are allowed to complete.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self
            .heartbeat_task
            .lock()
            .expect("heartbeat task lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Flip `paused` on.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Flip `paused` off. Triggers an immediate tick if running.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.kick.notify_one();
    }

    /// Wake the tick loop without waiting for the heartbeat.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Repeatedly tick until `pick_for_processing` returns empty and no
    /// entries remain in flight. Works even when stopped: temporarily
    /// impersonates a running, unpaused scheduler, then restores prior
    /// state (spec §4.3).
    pub async fn drain(&self) {
        let was_running = self.running.swap(true, Ordering::AcqRel);
        let was_paused = self.paused.swap(false, Ordering::AcqRel);

        loop {
            self.tick().await;

            let now = Utc::now();
            let pending = self
                .store
                .pick_for_processing(self.concurrency.max(1), now)
                .await
                .unwrap_or_default();

            if pending.is_empty() && self.in_flight.is_empty() {
                break;
            }

            if !self.in_flight.is_empty() {
                // `idle` is pulsed via `notify_waiters`, which only wakes
                // waiters already registered — arm it, then re-check so a
                // pulse that landed in the gap isn't lost.
                let notified = self.idle.notified();
                tokio::pin!(notified);
                if !self.in_flight.is_empty() {
                    let _ = tokio::time::timeout(std::time::Duration::from_millis(50), notified).await;
                }
            }
        }

        self.running.store(was_running, Ordering::Release);
        self.paused.store(was_paused, Ordering::Release);
    }

    /// One pass of the tick algorithm (spec §4.3).
    pub async fn tick(&self) {
        if self.paused.load(Ordering::Acquire) || !self.running.load(Ordering::Acquire) {
            return;
        }

        self.reclaim_stuck_processing().await;

        let slots = self.concurrency.saturating_sub(self.in_flight.len());
        if slots == 0 {
            return;
        }

        let now = Utc::now();
        let candidates = match self.store.pick_for_processing(slots, now).await {
            Ok(c) => c,
            Err(err) => {
                warn!(error = %err, "pick_for_processing failed during tick");
                return;
            }
        };

        for entry in candidates {
            if self.in_flight.len() >= self.concurrency {
                break;
            }
            if !self.in_flight.insert(entry.id.clone()) {
                continue;
            }

            let store = Arc::clone(&self.store);
            let transport = Arc::clone(&self.transport);
            let metrics = Arc::clone(&self.metrics);
            let retry_policy = self.retry_policy;
            let in_flight = Arc::clone(&self.in_flight);
            let idle = Arc::clone(&self.idle);
            let id = entry.id.clone();

            tokio::spawn(async move {
                process_entry(entry, store, transport, metrics, retry_policy).await;
                in_flight.remove(&id);
                idle.notify_waiters();
            });
        }
    }

    /// Any entry observed in `processing` with `(now - last_update) >
    /// lock_timeout` is forced back to `queued` with `attempt` incremented
    /// and `error = "lock timeout"` (spec §4.3). Since the store contract
    /// does not track a separate "last observed" timestamp, this uses
    /// `created_at` as the conservative baseline: an entry is reclaimed only
    /// if it has lived longer than `lock_timeout` *and* is not already
    /// tracked by this process's own in-flight set, which catches entries
    /// left `processing` by a crashed prior process.
    async fn reclaim_stuck_processing(&self) {
        let stuck = match self.store.processing_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed to list processing entries for reclaim sweep");
                return;
            }
        };

        let now = Utc::now();
        for entry in stuck {
            if self.in_flight.contains(&entry.id) {
                continue;
            }
            if now - entry.created_at <= self.lock_timeout {
                continue;
            }
            debug!(id = %entry.id, "reclaiming stuck processing entry");
            let reclaimed = entry.with_retry(now, "lock timeout");
            if let Err(err) = self.store.update(reclaimed).await {
                warn!(error = %err, id = %entry.id, "failed to reclaim stuck entry");
            }
        }
    }
}

/// Claim, dispatch, and settle one entry (spec §4.3 "per-entry processing").
///
/// Lives outside `Scheduler::tick` so it can run as an independent spawned
/// task; takes everything it needs by `Arc`/`Copy` rather than borrowing
/// `&Scheduler`.
async fn process_entry(
    entry: crate::entry::Entry,
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn OutboxTransport>,
    metrics: Arc<dyn MetricsSink>,
    retry_policy: RetryPolicy,
) {
    let channel = entry.channel.clone();

    if let Err(err) = store.update(entry.with_claimed()).await {
        warn!(error = %err, id = %entry.id, "failed to claim entry");
        return;
    }

    let t0 = std::time::Instant::now();
    let send_result = transport.send(&entry).await;
    let elapsed_ms = t0.elapsed().as_millis() as u64;

    let outcome = match send_result {
        Ok(result) if result.success => {
            metrics.send_timing(&channel, elapsed_ms, true);
            if let Err(err) = store.mark_done(&entry.id).await {
                warn!(error = %err, id = %entry.id, "failed to mark entry done");
            }
            SettleOutcome::Done
        }
        Ok(result) if result.permanently_failed => {
            metrics.send_timing(&channel, elapsed_ms, false);
            let error = result.error.unwrap_or_else(|| "permanent".to_string());
            if let Err(err) = store.mark_failed(&entry.id, &error, None).await {
                warn!(error = %err, id = %entry.id, "failed to mark entry failed");
            }
            SettleOutcome::Failed
        }
        Ok(result) => {
            metrics.send_timing(&channel, elapsed_ms, false);
            let error = result.error.unwrap_or_else(|| "transient failure".to_string());
            schedule_retry(&store, &entry, &error, &retry_policy, result.retry_after).await;
            SettleOutcome::Retried
        }
        Err(err) => {
            metrics.send_timing(&channel, elapsed_ms, false);
            schedule_retry(&store, &entry, &err.to_string(), &retry_policy, None).await;
            SettleOutcome::Retried
        }
    };

    metrics.settled(&channel, outcome);
}

async fn schedule_retry(
    store: &Arc<dyn OutboxStore>,
    entry: &crate::entry::Entry,
    error: &str,
    retry_policy: &RetryPolicy,
    retry_after: Option<std::time::Duration>,
) {
    let now = Utc::now();
    let previous_delay = entry
        .next_attempt_at
        .map(|t| (t - entry.created_at).to_std().unwrap_or_default());

    let mut next = retry_policy.next_attempt(entry.attempt + 1, now, previous_delay);
    if let Some(retry_after) = retry_after {
        let floor = now + chrono::Duration::from_std(retry_after).unwrap_or_default();
        next = next.max(floor);
    }

    let updated = entry.with_retry(next, error);
    if let Err(err) = store.update(updated).await {
        warn!(error = %err, id = %entry.id, "failed to schedule retry");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::OutboxConfig;
    use crate::entry::Entry;
    use crate::metrics::NoopMetricsSink;
    use crate::store::{MemoryStore, OutboxStore};
    use crate::transport::testing::{FixedTransport, FlakyTransport, RecordingTransport, SlowTransport};

    fn sample(id: &str, channel: &str, priority: i64) -> Entry {
        Entry::new(
            id,
            channel,
            serde_json::json!({}),
            None,
            None,
            priority,
            Utc::now(),
            None,
        )
    }

    async fn memory_store() -> Arc<dyn OutboxStore> {
        let store = MemoryStore::new();
        store.init().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_drain_processes_all_ready_entries() {
        let store = memory_store().await;
        store.insert(sample("a", "orders", 0)).await.unwrap();

        let recording = Arc::new(RecordingTransport::default());
        let config = OutboxConfig {
            auto_start: false,
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            recording.clone(),
            Arc::new(NoopMetricsSink),
            &config,
        ));

        scheduler.drain().await;

        assert_eq!(recording.received.lock().await.len(), 1);
        assert!(store
            .pick_for_processing(10, Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_settles_without_retry() {
        let store = memory_store().await;
        store.insert(sample("a", "orders", 0)).await.unwrap();

        let transport = Arc::new(FixedTransport::always_permanent_failure());
        let config = OutboxConfig {
            auto_start: false,
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            transport,
            Arc::new(NoopMetricsSink),
            &config,
        ));

        scheduler.drain().await;

        assert!(store
            .pick_for_processing(10, Utc::now())
            .await
            .unwrap()
            .is_empty());
        assert!(store.processing_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_eventually_succeed() {
        let store = memory_store().await;
        store.insert(sample("a", "orders", 0)).await.unwrap();

        let transport = Arc::new(FlakyTransport::new(2));
        let config = OutboxConfig {
            auto_start: false,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 5,
            },
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            transport,
            Arc::new(NoopMetricsSink),
            &config,
        ));

        for _ in 0..5 {
            scheduler.drain().await;
            tokio::time::sleep(Duration::from_millis(60)).await;
        }

        assert!(store
            .pick_for_processing(10, Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let store = memory_store().await;
        for i in 0..5 {
            store
                .insert(sample(&format!("e{i}"), "orders", 0))
                .await
                .unwrap();
        }

        let transport = Arc::new(SlowTransport::new(Duration::from_millis(100)));
        let config = OutboxConfig {
            auto_start: false,
            concurrency: 2,
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            transport.clone(),
            Arc::new(NoopMetricsSink),
            &config,
        ));

        scheduler.drain().await;

        assert!(transport.max_observed_in_flight().await <= 2);
    }

    #[tokio::test]
    async fn test_priority_overtake_is_honored_by_drain_order() {
        let store = memory_store().await;
        store.insert(sample("low", "orders", 0)).await.unwrap();
        store.insert(sample("high", "orders", 10)).await.unwrap();

        let recording = Arc::new(RecordingTransport::default());
        let config = OutboxConfig {
            auto_start: false,
            concurrency: 1,
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            recording.clone(),
            Arc::new(NoopMetricsSink),
            &config,
        ));

        scheduler.drain().await;

        let received = recording.received.lock().await;
        assert_eq!(received[0].id, "high");
        assert_eq!(received[1].id, "low");
    }

    #[tokio::test]
    async fn test_pause_blocks_ticking_until_resumed() {
        let store = memory_store().await;
        store.insert(sample("a", "orders", 0)).await.unwrap();

        let recording = Arc::new(RecordingTransport::default());
        let config = OutboxConfig::default();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            recording.clone(),
            Arc::new(NoopMetricsSink),
            &config,
        ));

        scheduler.running.store(true, Ordering::Release);
        scheduler.pause();
        scheduler.tick().await;
        assert!(recording.received.lock().await.is_empty());

        scheduler.resume();
        scheduler.drain().await;
        assert_eq!(recording.received.lock().await.len(), 1);
    }
}
