//! SQLite-backed [`OutboxStore`]: the persistent variant of the same
//! contract, with the schema from §4.2 and reopen-durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;

use crate::entry::{Entry, EntryStatus};

use super::{OutboxStore, StoreError};

/// A store backed by a SQLite database file (or `:memory:`).
///
/// Reopening the same file recovers all non-terminal entries verbatim (spec
/// §4.2, §8 scenario 7).
pub struct SqliteStore {
    pool: SqlitePool,
    watchers: Arc<DashMap<Option<String>, watch::Sender<u64>>>,
    initialized: std::sync::atomic::AtomicBool,
}

impl SqliteStore {
    /// Open (creating if absent) the database at `path`. Does not create the
    /// schema yet — call [`OutboxStore::init`] for that.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;
        Ok(Self {
            pool,
            watchers: Arc::new(DashMap::new()),
            initialized: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn require_init(&self) -> Result<(), StoreError> {
        if self.initialized.load(std::sync::atomic::Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<Entry, StoreError> {
        let payload_text: String = row.try_get("payload").map_err(StoreError::backend)?;
        let payload = serde_json::from_str(&payload_text).map_err(StoreError::backend)?;

        let headers_text: Option<String> = row.try_get("headers").map_err(StoreError::backend)?;
        let headers: Option<HashMap<String, String>> = match headers_text {
            Some(t) => Some(serde_json::from_str(&t).map_err(StoreError::backend)?),
            None => None,
        };

        let status_text: String = row.try_get("status").map_err(StoreError::backend)?;
        let status = EntryStatus::parse(&status_text)
            .ok_or_else(|| StoreError::backend(anyhow::anyhow!("corrupt status: {status_text}")))?;

        let next_attempt_millis: Option<i64> =
            row.try_get("next_attempt_at").map_err(StoreError::backend)?;
        let created_at_millis: i64 = row.try_get("created_at").map_err(StoreError::backend)?;

        Ok(Entry {
            id: row.try_get("id").map_err(StoreError::backend)?,
            channel: row.try_get("channel").map_err(StoreError::backend)?,
            payload,
            headers,
            idempotency_key: row.try_get("idempotency_key").map_err(StoreError::backend)?,
            priority: row.try_get("priority").map_err(StoreError::backend)?,
            attempt: {
                let a: i64 = row.try_get("attempt").map_err(StoreError::backend)?;
                a as u32
            },
            next_attempt_at: next_attempt_millis.map(millis_to_datetime),
            created_at: millis_to_datetime(created_at_millis),
            status,
            error: row.try_get("error").map_err(StoreError::backend)?,
        })
    }

    async fn queued_count(&self, channel: Option<&str>) -> Result<i64, StoreError> {
        let count: i64 = match channel {
            Some(c) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM outbox_entries WHERE status = 'queued' AND channel = ?",
                )
                .bind(c)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM outbox_entries WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?,
        };
        Ok(count)
    }

    async fn notify(&self, channel: &str) -> Result<(), StoreError> {
        for key in [None, Some(channel.to_string())] {
            if let Some(tx) = self.watchers.get(&key) {
                let count = self.queued_count(key.as_deref()).await? as u64;
                let _ = tx.send_if_modified(|prev| {
                    if *prev == count {
                        false
                    } else {
                        *prev = count;
                        true
                    }
                });
            }
        }
        Ok(())
    }
}

fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_entries (
                id              TEXT PRIMARY KEY,
                channel         TEXT NOT NULL,
                payload         TEXT NOT NULL,
                headers         TEXT,
                idempotency_key TEXT,
                priority        INTEGER NOT NULL DEFAULT 0,
                attempt         INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER,
                created_at      INTEGER NOT NULL,
                status          TEXT NOT NULL,
                error           TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_status_next \
             ON outbox_entries (status, next_attempt_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_channel_priority \
             ON outbox_entries (channel, priority DESC, next_attempt_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        self.initialized
            .store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn insert(&self, entry: Entry) -> Result<(), StoreError> {
        self.require_init()?;
        let payload = serde_json::to_string(&entry.payload).map_err(StoreError::backend)?;
        let headers = entry
            .headers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            INSERT INTO outbox_entries
                (id, channel, payload, headers, idempotency_key, priority, attempt,
                 next_attempt_at, created_at, status, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                channel = excluded.channel,
                payload = excluded.payload,
                headers = excluded.headers,
                idempotency_key = excluded.idempotency_key,
                priority = excluded.priority,
                attempt = excluded.attempt,
                next_attempt_at = excluded.next_attempt_at,
                created_at = excluded.created_at,
                status = excluded.status,
                error = excluded.error
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.channel)
        .bind(payload)
        .bind(headers)
        .bind(&entry.idempotency_key)
        .bind(entry.priority)
        .bind(entry.attempt as i64)
        .bind(entry.next_attempt_at.map(datetime_to_millis))
        .bind(datetime_to_millis(entry.created_at))
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        self.notify(&entry.channel).await?;
        Ok(())
    }

    async fn update(&self, entry: Entry) -> Result<(), StoreError> {
        self.require_init()?;
        let payload = serde_json::to_string(&entry.payload).map_err(StoreError::backend)?;
        let headers = entry
            .headers
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::backend)?;

        let result = sqlx::query(
            r#"
            UPDATE outbox_entries SET
                channel = ?, payload = ?, headers = ?, idempotency_key = ?,
                priority = ?, attempt = ?, next_attempt_at = ?, created_at = ?,
                status = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(&entry.channel)
        .bind(payload)
        .bind(headers)
        .bind(&entry.idempotency_key)
        .bind(entry.priority)
        .bind(entry.attempt as i64)
        .bind(entry.next_attempt_at.map(datetime_to_millis))
        .bind(datetime_to_millis(entry.created_at))
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .bind(&entry.id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        if result.rows_affected() > 0 {
            self.notify(&entry.channel).await?;
        }
        Ok(())
    }

    async fn mark_done(&self, id: &str) -> Result<(), StoreError> {
        self.require_init()?;
        let channel: Option<String> =
            sqlx::query_scalar("SELECT channel FROM outbox_entries WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::backend)?;

        if let Some(channel) = channel {
            sqlx::query("UPDATE outbox_entries SET status = 'done', error = NULL WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
            self.notify(&channel).await?;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.require_init()?;
        let channel: Option<String> =
            sqlx::query_scalar("SELECT channel FROM outbox_entries WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::backend)?;

        let Some(channel) = channel else {
            return Ok(());
        };

        match next_attempt {
            Some(next) => {
                sqlx::query(
                    "UPDATE outbox_entries SET status = 'queued', error = ?, \
                     next_attempt_at = ?, attempt = attempt + 1 WHERE id = ?",
                )
                .bind(error)
                .bind(datetime_to_millis(next))
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
            }
            None => {
                sqlx::query("UPDATE outbox_entries SET status = 'failed', error = ? WHERE id = ?")
                    .bind(error)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::backend)?;
            }
        }
        self.notify(&channel).await?;
        Ok(())
    }

    async fn pick_for_processing(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError> {
        self.require_init()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM outbox_entries
            WHERE status = 'queued'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY priority DESC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(datetime_to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn clear(&self, channel: Option<&str>) -> Result<(), StoreError> {
        self.require_init()?;
        match channel {
            Some(c) => {
                sqlx::query("DELETE FROM outbox_entries WHERE channel = ?")
                    .bind(c)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::backend)?;
                self.notify(c).await?;
            }
            None => {
                sqlx::query("DELETE FROM outbox_entries")
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::backend)?;
                let keys: Vec<Option<String>> =
                    self.watchers.iter().map(|kv| kv.key().clone()).collect();
                for key in keys {
                    if let Some(tx) = self.watchers.get(&key) {
                        let _ = tx.send_if_modified(|prev| {
                            if *prev == 0 {
                                false
                            } else {
                                *prev = 0;
                                true
                            }
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch_count(&self, channel: Option<&str>) -> Result<watch::Receiver<u64>, StoreError> {
        self.require_init()?;
        let key = channel.map(|c| c.to_string());
        if let Some(tx) = self.watchers.get(&key) {
            return Ok(tx.subscribe());
        }
        let initial = self.queued_count(channel).await? as u64;
        let (tx, rx) = watch::channel(initial);
        self.watchers.insert(key, tx);
        Ok(rx)
    }

    async fn processing_entries(&self) -> Result<Vec<Entry>, StoreError> {
        self.require_init()?;
        let rows = sqlx::query("SELECT * FROM outbox_entries WHERE status = 'processing'")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn failed_count(&self, channel: Option<&str>) -> Result<u64, StoreError> {
        self.require_init()?;
        let count: i64 = match channel {
            Some(c) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM outbox_entries WHERE status = 'failed' AND channel = ?",
                )
                .bind(c)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM outbox_entries WHERE status = 'failed'")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?,
        };
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, channel: &str, priority: i64, created_at: DateTime<Utc>) -> Entry {
        Entry::new(
            id,
            channel,
            serde_json::json!({"n": id}),
            None,
            None,
            priority,
            created_at,
            None,
        )
    }

    #[tokio::test]
    async fn test_operations_fail_before_init() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        let err = store.insert(sample("a", "orders", 0, Utc::now())).await;
        assert!(matches!(err, Err(StoreError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_insert_then_pick_round_trips() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        store.insert(sample("a", "orders", 0, now)).await.unwrap();

        let picked = store.pick_for_processing(10, now).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "a");
        assert_eq!(picked[0].channel, "orders");
    }

    #[tokio::test]
    async fn test_insert_is_upsert_by_id() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        store.insert(sample("a", "orders", 0, now)).await.unwrap();
        store.insert(sample("a", "orders", 9, now)).await.unwrap();

        let picked = store.pick_for_processing(10, now).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].priority, 9);
    }

    #[tokio::test]
    async fn test_pick_orders_by_priority_then_created_at() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        store.insert(sample("low", "orders", 0, t0)).await.unwrap();
        store.insert(sample("high", "orders", 10, t1)).await.unwrap();

        let picked = store.pick_for_processing(10, t1).await.unwrap();
        assert_eq!(picked[0].id, "high");
        assert_eq!(picked[1].id, "low");
    }

    #[tokio::test]
    async fn test_mark_failed_with_schedule_requeues_and_increments_attempt() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        store.insert(sample("a", "orders", 0, now)).await.unwrap();
        let next = now + chrono::Duration::milliseconds(50);
        store.mark_failed("a", "timeout", Some(next)).await.unwrap();

        assert!(store.pick_for_processing(10, now).await.unwrap().is_empty());
        let picked = store.pick_for_processing(10, next).await.unwrap();
        assert_eq!(picked[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_mark_failed_without_schedule_is_terminal() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        store.insert(sample("a", "orders", 0, now)).await.unwrap();
        store.mark_failed("a", "400", None).await.unwrap();
        assert!(store.pick_for_processing(10, now).await.unwrap().is_empty());
        assert!(store.processing_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_channel_scoped() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        store.insert(sample("a", "orders", 0, now)).await.unwrap();
        store.insert(sample("b", "shipments", 0, now)).await.unwrap();
        store.clear(Some("orders")).await.unwrap();

        let remaining = store.pick_for_processing(10, now).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].channel, "shipments");
    }

    #[tokio::test]
    async fn test_failed_count_tracks_terminal_failures_only() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        store.insert(sample("a", "orders", 0, now)).await.unwrap();
        store.insert(sample("b", "orders", 0, now)).await.unwrap();
        store.mark_failed("a", "400", None).await.unwrap();

        assert_eq!(store.failed_count(None).await.unwrap(), 1);
        assert_eq!(store.failed_count(Some("orders")).await.unwrap(), 1);
        assert_eq!(store.failed_count(Some("shipments")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_recovers_non_terminal_entries_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.sqlite3");
        let path_str = path.to_str().unwrap().to_string();

        let now = Utc::now();
        {
            let store = SqliteStore::connect(&path_str).await.unwrap();
            store.init().await.unwrap();
            store
                .insert(sample("persistent-1", "test", 0, now))
                .await
                .unwrap();
        }

        let reopened = SqliteStore::connect(&path_str).await.unwrap();
        reopened.init().await.unwrap();
        let picked = reopened.pick_for_processing(10, now).await.unwrap();

        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "persistent-1");
        assert_eq!(picked[0].channel, "test");
        assert_eq!(picked[0].payload, serde_json::json!({"n": "persistent-1"}));
        assert_eq!(picked[0].status, EntryStatus::Queued);
    }

    #[tokio::test]
    async fn test_headers_and_idempotency_key_round_trip() {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        store.init().await.unwrap();
        let now = Utc::now();
        let mut headers = HashMap::new();
        headers.insert("x-trace".to_string(), "abc".to_string());
        let entry = Entry::new(
            "a",
            "orders",
            serde_json::json!({"k": "v"}),
            Some(headers),
            Some("idem-1".to_string()),
            0,
            now,
            None,
        );
        store.insert(entry).await.unwrap();

        let picked = store.pick_for_processing(10, now).await.unwrap();
        assert_eq!(picked[0].idempotency_key.as_deref(), Some("idem-1"));
        assert_eq!(
            picked[0].headers.as_ref().unwrap().get("x-trace").map(String::as_str),
            Some("abc")
        );
    }
}
