//! The entry store contract (spec §4.2): a priority/time-ordered ready set
//! with atomic status transitions and count observation.
//!
//! [`MemoryStore`] is a first-class implementation, not a test double — it is
//! the right choice for embeds that don't need reopen-durability. The
//! `sqlite` feature adds [`SqliteStore`] for the persistent variant.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;

use crate::entry::Entry;

/// Errors a store backend can raise.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An operation was attempted before `init()`.
    #[error("store used before init()")]
    NotInitialized,

    /// The backend itself failed (I/O, serialization, driver error).
    #[error("store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// Wrap an arbitrary backend failure.
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend(err.into())
    }
}

/// A persistent table of queued work with priority, retry scheduling, and
/// status (spec §4.2).
///
/// All operations except [`OutboxStore::init`] must fail with
/// [`StoreError::NotInitialized`] before `init()` has run.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Idempotent; creates schema if missing.
    async fn init(&self) -> Result<(), StoreError>;

    /// Upsert by `id`; replaces any existing entry with the same id.
    async fn insert(&self, entry: Entry) -> Result<(), StoreError>;

    /// Replace by `id`; a no-op if the id is absent.
    async fn update(&self, entry: Entry) -> Result<(), StoreError>;

    /// Set status=`done`, clear error.
    async fn mark_done(&self, id: &str) -> Result<(), StoreError>;

    /// If `next_attempt` is `Some`, transition to `queued` with that schedule
    /// and `error`; if `None`, transition to terminal `failed`. See spec §9:
    /// this split must not be conflated.
    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Up to `limit` entries with `status=queued` and
    /// `next_attempt_at` null or `<= now`, ordered by `(priority desc,
    /// created_at asc)`. Read-only: claiming is the caller's job via
    /// [`OutboxStore::update`].
    async fn pick_for_processing(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError>;

    /// Delete all entries, or only those in `channel` when given.
    async fn clear(&self, channel: Option<&str>) -> Result<(), StoreError>;

    /// A lazy, restartable sequence of counts: first emission is the current
    /// count, subsequent emissions on any mutation affecting `channel` (or
    /// any channel, when `None`).
    async fn watch_count(&self, channel: Option<&str>) -> Result<watch::Receiver<u64>, StoreError>;

    /// Entries currently in `processing`, reclaimed by the scheduler's
    /// watchdog when stuck past `lock_timeout`. Exposed separately from
    /// `pick_for_processing` because it is not priority-ordered and is only
    /// used for the reclaim sweep.
    async fn processing_entries(&self) -> Result<Vec<Entry>, StoreError>;

    /// Count of entries in terminal `failed` status, or only those in
    /// `channel` when given. Backs [`crate::facade::OutboxState::failed_count`]
    /// (spec §9: "the spec mandates that implementations track these
    /// explicitly from the store").
    async fn failed_count(&self, channel: Option<&str>) -> Result<u64, StoreError>;
}
