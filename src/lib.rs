//! # outbox
//!
//! A durable, offline-tolerant outbox: a persistent queue that accepts
//! application events and delivers them exactly-once-semantically to an
//! external endpoint, with at-least-once transport and idempotent
//! de-duplication.
//!
//! ## Architecture
//!
//! ```text
//! enqueue()
//!     │
//!     ▼
//! OutboxStore.insert (status=queued)
//!     │
//!     ▼ tick (heartbeat, or kicked by enqueue/resume/drain)
//! Scheduler.tick
//!     │
//!     ├─► OutboxStore.pick_for_processing ──► candidates
//!     │
//!     └─► for each candidate, spawn process_entry:
//!             OutboxStore.update (status=processing)
//!             OutboxTransport.send
//!             ├─ success           ─► OutboxStore.mark_done
//!             ├─ permanently_failed ─► OutboxStore.mark_failed(next_attempt=None)
//!             └─ transient         ─► RetryPolicy.next_attempt, OutboxStore.update
//! ```
//!
//! ## Key invariants
//!
//! 1. **`insert` is upsert, `update` is a no-op on a missing id** — callers
//!    may freely retry inserts; settle paths never resurrect a deleted entry.
//! 2. **An entry in `processing` is owned by exactly one worker** — the
//!    scheduler's `in_flight` set is private; claims go through the store.
//! 3. **`done` and `failed` are terminal** — nothing in this crate
//!    transitions an entry out of them.
//! 4. **Single-writer** — at most one [`Outbox`]/[`Scheduler`] may operate on
//!    a given persistent store at a time; cross-process coordination is out
//!    of scope.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use outbox::{Outbox, OutboxConfig};
//! use outbox::store::MemoryStore;
//! use outbox::transport::http::HttpTransport;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let transport = Arc::new(HttpTransport::new(
//!     "https://example.com/deliver",
//!     std::time::Duration::from_secs(15),
//! ));
//! let outbox = Outbox::new(store, transport, OutboxConfig::default());
//! outbox.init().await?;
//!
//! outbox
//!     .enqueue("orders", serde_json::json!({"orderId": "o-1"}), None, None, 0, None)
//!     .await?;
//!
//! outbox.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## What this is not
//!
//! This crate is **not**:
//! - An exactly-once delivery system at the transport layer (relies on
//!   server-side idempotency)
//! - A multi-process coordinator over a single database
//! - An encryption-at-rest layer

pub mod config;
pub mod entry;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use config::OutboxConfig;
pub use entry::{Entry, EntryStatus};
pub use error::OutboxError;
pub use facade::{Outbox, OutboxState};
pub use metrics::{MetricsSink, NoopMetricsSink, SettleOutcome};
pub use retry::{classify_status, RetryPolicy, StatusClass};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, OutboxStore, StoreError};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use transport::{OutboxTransport, SendResult};
