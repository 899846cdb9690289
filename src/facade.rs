//! The public facade (spec §4.4 / §6): enqueue, lifecycle, pause/resume/
//! drain, and state observation, composed over a store, a transport, and a
//! scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use crate::config::OutboxConfig;
use crate::entry::Entry;
use crate::error::OutboxError;
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::scheduler::Scheduler;
use crate::store::OutboxStore;
use crate::transport::OutboxTransport;

/// A snapshot of outbox activity, refreshed on every mutation (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxState {
    pub is_paused: bool,
    pub is_running: bool,
    pub queued_count: u64,
    pub processing_count: u64,
    pub failed_count: u64,
}

/// Thin coordinator holding the store, transport, config, metrics sink, and
/// a lazily constructed scheduler.
///
/// `Outbox` must be initialized with [`Outbox::init`] before
/// [`Outbox::enqueue`] or any other operation; everything else returns
/// [`OutboxError::NotInitialized`] beforehand.
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn OutboxTransport>,
    metrics: Arc<dyn MetricsSink>,
    config: OutboxConfig,
    scheduler: std::sync::Mutex<Option<Arc<Scheduler>>>,
    state_tx: watch::Sender<OutboxState>,
    state_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    initialized: std::sync::atomic::AtomicBool,
}

impl Outbox {
    /// Build a facade with a no-op metrics sink. See
    /// [`Outbox::builder_with_metrics`] to install a real one.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn OutboxTransport>,
        config: OutboxConfig,
    ) -> Self {
        Self::with_metrics(store, transport, Arc::new(NoopMetricsSink), config)
    }

    /// Build a facade with an explicit metrics sink.
    pub fn with_metrics(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn OutboxTransport>,
        metrics: Arc<dyn MetricsSink>,
        config: OutboxConfig,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(OutboxState::default());
        Self {
            store,
            transport,
            metrics,
            config,
            scheduler: std::sync::Mutex::new(None),
            state_tx,
            state_task: std::sync::Mutex::new(None),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Idempotent initialization; must precede all other operations.
    ///
    /// Initializes the store, then constructs the scheduler and optionally
    /// starts it per `config.auto_start`.
    pub async fn init(&self) -> Result<(), OutboxError> {
        self.store.init().await?;

        let scheduler = {
            let mut guard = self.scheduler.lock().expect("scheduler lock poisoned");
            if let Some(existing) = guard.as_ref() {
                Arc::clone(existing)
            } else {
                let scheduler = Arc::new(Scheduler::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.transport),
                    Arc::clone(&self.metrics),
                    &self.config,
                ));
                *guard = Some(Arc::clone(&scheduler));
                scheduler
            }
        };

        if self.config.auto_start {
            scheduler.start().await;
        }

        self.initialized
            .store(true, std::sync::atomic::Ordering::Release);
        self.refresh_state().await?;
        self.spawn_state_task(scheduler).await?;
        info!("outbox initialized");
        Ok(())
    }

    /// Spawn the task that keeps [`Outbox::watch`] driven by the store's
    /// count stream rather than only by explicit facade calls (spec §4.4:
    /// `OutboxState` is "derived by composing the store's count stream with
    /// the scheduler's live flags"). The scheduler settles entries on its
    /// own heartbeat via `store.mark_done`/`update`, which this task picks up
    /// the same way a direct `enqueue`/`drain`/`clear` does.
    async fn spawn_state_task(&self, scheduler: Arc<Scheduler>) -> Result<(), OutboxError> {
        let mut guard = self.state_task.lock().expect("state task lock poisoned");
        if guard.is_some() {
            return Ok(());
        }

        let mut rx = self.store.watch_count(None).await?;
        let store = Arc::clone(&self.store);
        let state_tx = self.state_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let processing_count = store
                    .processing_entries()
                    .await
                    .map(|v| v.len() as u64)
                    .unwrap_or(0);
                let failed_count = store.failed_count(None).await.unwrap_or(0);
                let queued_count = *rx.borrow_and_update();

                let _ = state_tx.send(OutboxState {
                    is_paused: scheduler.is_paused(),
                    is_running: scheduler.is_running(),
                    queued_count,
                    processing_count,
                    failed_count,
                });

                if rx.changed().await.is_err() {
                    break;
                }
            }
        });

        *guard = Some(handle);
        Ok(())
    }

    fn require_init(&self) -> Result<(), OutboxError> {
        if self.initialized.load(std::sync::atomic::Ordering::Acquire) {
            Ok(())
        } else {
            Err(OutboxError::NotInitialized)
        }
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.lock().expect("scheduler lock poisoned").clone()
    }

    /// Generates an id, stamps `created_at`, inserts the entry, emits an
    /// `enqueued` metric, and kicks the scheduler if `auto_start`. Returns
    /// the generated id.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        channel: impl Into<String>,
        payload: serde_json::Value,
        headers: Option<HashMap<String, String>>,
        idempotency_key: Option<String>,
        priority: i64,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<String, OutboxError> {
        self.require_init()?;

        let channel = channel.into();
        if channel.is_empty() {
            return Err(OutboxError::EmptyChannel);
        }
        if let Some(key) = &idempotency_key {
            if key.is_empty() || key.len() > 256 {
                return Err(OutboxError::InvalidIdempotencyKey);
            }
        }

        let now = Utc::now();
        let id = Entry::new_id();
        let entry = Entry::new(
            id.clone(),
            channel.clone(),
            payload,
            headers,
            idempotency_key,
            priority,
            now,
            Some(not_before.unwrap_or(now)),
        );

        self.store.insert(entry).await?;
        self.metrics.enqueued(&channel);

        if self.config.auto_start {
            if let Some(scheduler) = self.scheduler() {
                scheduler.kick();
            }
        }

        self.refresh_state().await?;
        Ok(id)
    }

    /// Processes until empty.
    pub async fn drain(&self) -> Result<(), OutboxError> {
        self.require_init()?;
        if let Some(scheduler) = self.scheduler() {
            scheduler.drain().await;
        }
        self.refresh_state().await
    }

    /// Pauses the scheduler.
    pub fn pause(&self) -> Result<(), OutboxError> {
        self.require_init()?;
        if let Some(scheduler) = self.scheduler() {
            scheduler.pause();
        }
        Ok(())
    }

    /// Resumes the scheduler; triggers an immediate tick if running.
    pub fn resume(&self) -> Result<(), OutboxError> {
        self.require_init()?;
        if let Some(scheduler) = self.scheduler() {
            scheduler.resume();
        }
        Ok(())
    }

    /// Deletes all entries, or only those in `channel` when given.
    pub async fn clear(&self, channel: Option<&str>) -> Result<(), OutboxError> {
        self.require_init()?;
        self.store.clear(channel).await?;
        self.refresh_state().await
    }

    /// A lazy sequence of [`OutboxState`] snapshots, refreshed on every
    /// mutation.
    pub fn watch(&self) -> watch::Receiver<OutboxState> {
        self.state_tx.subscribe()
    }

    /// Releases the scheduler. The store is not explicitly closed here: it
    /// is dropped along with this facade, consistent with store backends
    /// (e.g. a pooled SQLite connection) closing on `Drop`.
    pub async fn close(&self) -> Result<(), OutboxError> {
        self.require_init()?;
        if let Some(scheduler) = self.scheduler.lock().expect("scheduler lock poisoned").take() {
            scheduler.stop();
        }
        if let Some(handle) = self.state_task.lock().expect("state task lock poisoned").take() {
            handle.abort();
        }
        Ok(())
    }

    /// Recompute [`OutboxState`] from the store and scheduler and publish it
    /// to [`Outbox::watch`] subscribers.
    async fn refresh_state(&self) -> Result<(), OutboxError> {
        let queued_count = {
            let mut rx = self.store.watch_count(None).await?;
            *rx.borrow_and_update()
        };
        let processing_count = self.store.processing_entries().await?.len() as u64;
        let failed_count = self.store.failed_count(None).await?;

        let (is_running, is_paused) = match self.scheduler() {
            Some(scheduler) => (scheduler.is_running(), scheduler.is_paused()),
            None => (false, false),
        };

        let _ = self.state_tx.send(OutboxState {
            is_paused,
            is_running,
            queued_count,
            processing_count,
            failed_count,
        });
        Ok(())
    }
}
