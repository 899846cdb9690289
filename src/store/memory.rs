//! In-memory [`OutboxStore`] implementation.
//!
//! Not gated behind `#[cfg(test)]` — an in-process outbox (e.g. a
//! short-lived worker with no durability requirement) is a legitimate
//! deployment, not just a test fixture.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::entry::{Entry, EntryStatus};

use super::{OutboxStore, StoreError};

/// Key under which a [`watch::Sender`] is registered: `None` watches every
/// channel, `Some(channel)` watches just that one.
type WatchKey = Option<String>;

/// In-memory, non-durable store. Safe to share across tasks; internally
/// synchronized with a [`RwLock`] over the entry table.
pub struct MemoryStore {
    initialized: std::sync::atomic::AtomicBool,
    entries: RwLock<HashMap<String, Entry>>,
    watchers: DashMap<WatchKey, watch::Sender<u64>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Construct an uninitialized store. Call [`OutboxStore::init`] before
    /// use.
    pub fn new() -> Self {
        Self {
            initialized: std::sync::atomic::AtomicBool::new(false),
            entries: RwLock::new(HashMap::new()),
            watchers: DashMap::new(),
        }
    }

    fn require_init(&self) -> Result<(), StoreError> {
        if self.initialized.load(std::sync::atomic::Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// `queued` count for the given channel (or all channels).
    fn queued_count_locked(entries: &HashMap<String, Entry>, channel: Option<&str>) -> u64 {
        entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued)
            .filter(|e| channel.map(|c| e.channel == c).unwrap_or(true))
            .count() as u64
    }

    /// Recompute and publish counts to every registered watcher whose key
    /// could have been affected by a mutation to `channel`.
    fn notify(&self, channel: &str) {
        let entries = self.entries.read().expect("memory store lock poisoned");
        for key in [None, Some(channel.to_string())] {
            if let Some(tx) = self.watchers.get(&key) {
                let count = Self::queued_count_locked(&entries, key.as_deref());
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
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.initialized
            .store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn insert(&self, entry: Entry) -> Result<(), StoreError> {
        self.require_init()?;
        let channel = entry.channel.clone();
        {
            let mut entries = self.entries.write().expect("memory store lock poisoned");
            entries.insert(entry.id.clone(), entry);
        }
        self.notify(&channel);
        Ok(())
    }

    async fn update(&self, entry: Entry) -> Result<(), StoreError> {
        self.require_init()?;
        let channel = entry.channel.clone();
        let existed = {
            let mut entries = self.entries.write().expect("memory store lock poisoned");
            if entries.contains_key(&entry.id) {
                entries.insert(entry.id.clone(), entry);
                true
            } else {
                false
            }
        };
        if existed {
            self.notify(&channel);
        }
        Ok(())
    }

    async fn mark_done(&self, id: &str) -> Result<(), StoreError> {
        self.require_init()?;
        let channel = {
            let mut entries = self.entries.write().expect("memory store lock poisoned");
            match entries.get(id) {
                Some(existing) => {
                    let done = existing.with_done();
                    let channel = done.channel.clone();
                    entries.insert(id.to_string(), done);
                    Some(channel)
                }
                None => None,
            }
        };
        if let Some(channel) = channel {
            self.notify(&channel);
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
        let channel = {
            let mut entries = self.entries.write().expect("memory store lock poisoned");
            match entries.get(id) {
                Some(existing) => {
                    let updated = match next_attempt {
                        Some(next) => existing.with_retry(next, error),
                        None => existing.with_failed(error),
                    };
                    let channel = updated.channel.clone();
                    entries.insert(id.to_string(), updated);
                    Some(channel)
                }
                None => None,
            }
        };
        if let Some(channel) = channel {
            self.notify(&channel);
        }
        Ok(())
    }

    async fn pick_for_processing(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError> {
        self.require_init()?;
        let entries = self.entries.read().expect("memory store lock poisoned");
        let mut ready: Vec<Entry> = entries
            .values()
            .filter(|e| e.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn clear(&self, channel: Option<&str>) -> Result<(), StoreError> {
        self.require_init()?;
        {
            let mut entries = self.entries.write().expect("memory store lock poisoned");
            match channel {
                Some(c) => entries.retain(|_, e| e.channel != c),
                None => entries.clear(),
            }
        }
        match channel {
            Some(c) => self.notify(c),
            None => {
                // Every watcher could be affected; republish each one.
                let keys: Vec<WatchKey> = self.watchers.iter().map(|kv| kv.key().clone()).collect();
                for key in keys {
                    match key {
                        Some(c) => self.notify(&c),
                        None => {
                            let entries = self.entries.read().expect("memory store lock poisoned");
                            if let Some(tx) = self.watchers.get(&None) {
                                let count = Self::queued_count_locked(&entries, None);
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
        let initial = {
            let entries = self.entries.read().expect("memory store lock poisoned");
            Self::queued_count_locked(&entries, channel)
        };
        let (tx, rx) = watch::channel(initial);
        self.watchers.insert(key, tx);
        Ok(rx)
    }

    async fn processing_entries(&self) -> Result<Vec<Entry>, StoreError> {
        self.require_init()?;
        let entries = self.entries.read().expect("memory store lock poisoned");
        Ok(entries
            .values()
            .filter(|e| e.status == EntryStatus::Processing)
            .cloned()
            .collect())
    }

    async fn failed_count(&self, channel: Option<&str>) -> Result<u64, StoreError> {
        self.require_init()?;
        let entries = self.entries.read().expect("memory store lock poisoned");
        Ok(entries
            .values()
            .filter(|e| e.status == EntryStatus::Failed)
            .filter(|e| channel.map(|c| e.channel == c).unwrap_or(true))
            .count() as u64)
    }
}
