//! The outbox entry: a queued unit of work with priority, retry scheduling,
//! and status.
//!
//! An [`Entry`] is a plain value type, immutable by convention. Nothing in
//! this module mutates an `Entry` in place; callers get a new value back from
//! the `with_*` helpers and hand it to [`crate::store::OutboxStore::update`]
//! or [`crate::store::OutboxStore::insert`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an [`Entry`].
///
/// ```text
///            enqueue
/// queued ───────────────► (initial)
/// queued ── claim ──────► processing
/// processing ── success ► done         (terminal)
/// processing ── permanent► failed      (terminal)
/// processing ── transient (retryable) ─► queued (next_attempt_at advanced)
/// ```
///
/// `done` and `failed` are terminal: nothing in this crate transitions an
/// entry out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Eligible for claim once `next_attempt_at` has passed.
    Queued,
    /// Claimed by exactly one worker; owned until settled.
    Processing,
    /// Terminal: delivered successfully.
    Done,
    /// Terminal: the transport declared this unrecoverable.
    Failed,
}

impl EntryStatus {
    /// The column value this status is stored as in the persistent store.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Processing => "processing",
            EntryStatus::Done => "done",
            EntryStatus::Failed => "failed",
        }
    }

    /// Parse a status column value.
    ///
    /// Returns `None` for anything not written by this crate; callers should
    /// treat that as a corrupt row rather than guess at a fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EntryStatus::Queued),
            "processing" => Some(EntryStatus::Processing),
            "done" => Some(EntryStatus::Done),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }

    /// `done` and `failed` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Done | EntryStatus::Failed)
    }
}

/// A queued unit of work.
///
/// `id` is the primary key; re-inserting an `Entry` with an existing `id`
/// replaces it (upsert semantics — see [`crate::store::OutboxStore::insert`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Globally unique for the lifetime of the store.
    pub id: String,
    /// Logical sub-queue, used for filtered queries. Never empty.
    pub channel: String,
    /// Arbitrary JSON-encodable payload, opaque to the core.
    pub payload: serde_json::Value,
    /// Passed to the transport as-is.
    pub headers: Option<HashMap<String, String>>,
    /// Opaque dedup hint carried to the transport, 1..256 chars.
    pub idempotency_key: Option<String>,
    /// Higher wins; may be negative.
    pub priority: i64,
    /// Incremented on every transient failure.
    pub attempt: u32,
    /// Earliest time this entry is eligible for claim. `None` means
    /// immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set once at enqueue.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: EntryStatus,
    /// Last error, for diagnostics. Not a `std::error::Error` — it's data,
    /// not something callers match on.
    pub error: Option<String>,
}

impl Entry {
    /// Build a freshly enqueued entry. `id` and `created_at` are stamped by
    /// the facade, not here, so this stays a pure constructor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        payload: serde_json::Value,
        headers: Option<HashMap<String, String>>,
        idempotency_key: Option<String>,
        priority: i64,
        created_at: DateTime<Utc>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            payload,
            headers,
            idempotency_key,
            priority,
            attempt: 0,
            next_attempt_at,
            created_at,
            status: EntryStatus::Queued,
            error: None,
        }
    }

    /// Copy-and-update: claim for processing.
    pub fn with_claimed(&self) -> Self {
        let mut next = self.clone();
        next.status = EntryStatus::Processing;
        next
    }

    /// Copy-and-update: settle as done.
    pub fn with_done(&self) -> Self {
        let mut next = self.clone();
        next.status = EntryStatus::Done;
        next.error = None;
        next
    }

    /// Copy-and-update: settle as permanently failed.
    pub fn with_failed(&self, error: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.status = EntryStatus::Failed;
        next.error = Some(error.into());
        next
    }

    /// Copy-and-update: schedule a transient retry.
    ///
    /// `next_attempt_at` must be strictly in the future relative to `now`
    /// under normal operation; the retry policy is responsible for that, not
    /// this helper.
    pub fn with_retry(&self, next_attempt_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.status = EntryStatus::Queued;
        next.attempt += 1;
        next.next_attempt_at = Some(next_attempt_at);
        next.error = Some(error.into());
        next
    }

    /// Is this entry eligible for claim at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Queued
            && self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }

    /// Generate a new opaque entry id (UUID v4, as recommended by the spec).
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> Entry {
        Entry::new(
            Entry::new_id(),
            "orders",
            serde_json::json!({"orderId": "o-1"}),
            None,
            None,
            0,
            now,
            None,
        )
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for s in [
            EntryStatus::Queued,
            EntryStatus::Processing,
            EntryStatus::Done,
            EntryStatus::Failed,
        ] {
            assert_eq!(EntryStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(EntryStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EntryStatus::Done.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
        assert!(!EntryStatus::Queued.is_terminal());
        assert!(!EntryStatus::Processing.is_terminal());
    }

    #[test]
    fn test_new_entry_is_queued_with_zero_attempts() {
        let now = Utc::now();
        let e = sample(now);
        assert_eq!(e.status, EntryStatus::Queued);
        assert_eq!(e.attempt, 0);
        assert!(e.error.is_none());
    }

    #[test]
    fn test_ready_when_queued_and_due() {
        let now = Utc::now();
        let e = sample(now);
        assert!(e.is_ready(now));

        let future = now + chrono::Duration::seconds(60);
        let mut delayed = e.clone();
        delayed.next_attempt_at = Some(future);
        assert!(!delayed.is_ready(now));
        assert!(delayed.is_ready(future));
    }

    #[test]
    fn test_not_ready_unless_queued() {
        let now = Utc::now();
        let e = sample(now).with_claimed();
        assert!(!e.is_ready(now));
    }

    #[test]
    fn test_with_retry_increments_attempt_and_reschedules() {
        let now = Utc::now();
        let e = sample(now).with_claimed();
        let next = now + chrono::Duration::milliseconds(500);
        let retried = e.with_retry(next, "timeout");

        assert_eq!(retried.status, EntryStatus::Queued);
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.next_attempt_at, Some(next));
        assert_eq!(retried.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_with_done_clears_error() {
        let now = Utc::now();
        let e = sample(now)
            .with_claimed()
            .with_retry(now, "boom")
            .with_claimed()
            .with_done();
        assert_eq!(e.status, EntryStatus::Done);
        assert!(e.error.is_none());
    }

    #[test]
    fn test_with_failed_records_error() {
        let now = Utc::now();
        let e = sample(now).with_claimed().with_failed("400 bad request");
        assert_eq!(e.status, EntryStatus::Failed);
        assert_eq!(e.error.as_deref(), Some("400 bad request"));
    }

    #[test]
    fn test_original_entry_is_unchanged_by_copy_and_update() {
        let now = Utc::now();
        let e = sample(now);
        let _claimed = e.with_claimed();
        assert_eq!(e.status, EntryStatus::Queued);
    }
}
