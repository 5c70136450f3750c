//! Per-shard deduplication state, behind a pluggable trait for swapping in a
//! persisted backend. The store only answers "have I seen this key" and remembers
//! the event time of the first sighting; expiry is driven from outside by the
//! shard's watermark through [DedupStore::purge_before].
//!
//! The trait uses `async_trait` to enable object safety, allowing usage as
//! `Box<dyn DedupStore>` for dynamic dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::config::CapacityPolicy;
use crate::message::DedupKey;

/// Error type for store operations. Only [StoreError::Transient] failures are worth
/// retrying; everything else halts the owning shard.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store Capacity - limit reached with {0} keys tracked")]
    Capacity(usize),

    #[error("Transient Store Error - {0}")]
    Transient(String),
}

impl StoreError {
    /// Whether a retry can be expected to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Capacity(_) => false,
            StoreError::Transient(_) => true,
        }
    }
}

/// Builds the store of each shard at pipeline construction, keyed by the shard
/// index.
pub type StoreFactory = Arc<dyn Fn(u16) -> Box<dyn DedupStore> + Send + Sync>;

/// DedupStore holds the first-seen event time per dedup key for a single shard.
/// Exactly one shard talks to a given store instance, so implementations do not
/// need to coordinate writers.
///
/// This trait is object-safe and can be used as `Box<dyn DedupStore>` for dynamic
/// dispatch.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Returns whether the key is already tracked.
    async fn seen(&self, key: &DedupKey) -> Result<bool, StoreError>;

    /// Records the event time of the key's first sighting. Recording an already
    /// tracked key is a no-op; the first sighting is never overwritten.
    async fn record_first_seen(
        &self,
        key: DedupKey,
        event_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Removes every entry whose first-seen event time is strictly older than
    /// `cutoff`.
    ///
    /// # Returns
    /// The number of entries removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of keys currently tracked.
    async fn tracked(&self) -> Result<usize, StoreError>;
}

/// The built-in store: a map from key to first-seen event time plus a time index
/// ordering the entries for purge and eviction. Capacity is optional; a bounded
/// store full of keys applies its [CapacityPolicy] when the next new key arrives.
pub struct InMemoryStore {
    inner: parking_lot::Mutex<Inner>,
}

struct Inner {
    entries: HashMap<DedupKey, DateTime<Utc>>,
    /// first-seen time to the keys recorded at that time, in recording order
    by_time: BTreeMap<DateTime<Utc>, Vec<DedupKey>>,
    capacity: Option<usize>,
    policy: CapacityPolicy,
}

impl Inner {
    /// Drops the entry with the oldest first-seen time. Ties are broken by
    /// recording order.
    fn evict_oldest(&mut self) -> Option<DedupKey> {
        let (first_seen, key, bucket_drained) = {
            let (first_seen, keys) = self.by_time.iter_mut().next()?;
            let key = keys.remove(0);
            (*first_seen, key, keys.is_empty())
        };
        if bucket_drained {
            self.by_time.remove(&first_seen);
        }
        self.entries.remove(&key);
        Some(key)
    }
}

impl InMemoryStore {
    pub fn new(capacity: Option<usize>, policy: CapacityPolicy) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                entries: HashMap::new(),
                by_time: BTreeMap::new(),
                capacity,
                policy,
            }),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(None, CapacityPolicy::default())
    }
}

#[async_trait]
impl DedupStore for InMemoryStore {
    async fn seen(&self, key: &DedupKey) -> Result<bool, StoreError> {
        Ok(self.inner.lock().entries.contains_key(key))
    }

    async fn record_first_seen(
        &self,
        key: DedupKey,
        event_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            return Ok(());
        }

        if let Some(capacity) = inner.capacity
            && inner.entries.len() >= capacity
        {
            match inner.policy {
                CapacityPolicy::FailFast => {
                    return Err(StoreError::Capacity(inner.entries.len()));
                }
                CapacityPolicy::EvictOldest => {
                    if let Some(evicted) = inner.evict_oldest() {
                        debug!(%evicted, "evicted oldest entry to make room for a new key");
                    }
                }
            }
        }

        inner.entries.insert(key.clone(), event_time);
        inner.by_time.entry(event_time).or_default().push(key);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let keep = inner.by_time.split_off(&cutoff);
        let purge = std::mem::replace(&mut inner.by_time, keep);

        let mut removed = 0;
        for keys in purge.into_values() {
            for key in keys {
                inner.entries.remove(&key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn tracked(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().entries.len())
    }
}
