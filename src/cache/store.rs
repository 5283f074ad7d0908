//! Entry storage and the tag index.
//!
//! [`EntryStore`] is the seam for alternative backends. [`MemoryStore`] keeps
//! entries and the tag index behind one mutex so that every mutation updates
//! both together: a key is listed under tag `T` only while its live entry
//! carries `T`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::error::CacheError;
use super::key::KeyId;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// Storage backend for cached responses.
///
/// Every operation is fallible so a remote backend can report
/// [`CacheError::StoreUnavailable`]; callers treat any error as a miss.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Returns the entry under `key`, expired or not.
    async fn get(&self, key: KeyId) -> Result<Option<Arc<CacheEntry>>, CacheError>;

    /// Stores `entry`, replacing whatever was under its key.
    async fn put(&self, entry: Arc<CacheEntry>) -> Result<(), CacheError>;

    /// Removes the entry under `key`. Returns whether one was present.
    async fn evict_by_key(&self, key: KeyId) -> Result<bool, CacheError>;

    /// Removes every entry tagged `tag` and returns how many were removed.
    async fn evict_by_tag(&self, tag: &str) -> Result<usize, CacheError>;

    /// Removes every expired entry and returns how many were removed.
    async fn sweep(&self) -> Result<usize, CacheError>;
}

struct Inner {
    entries: LruCache<KeyId, Arc<CacheEntry>>,
    tags: HashMap<String, HashSet<KeyId>>,
    size: usize,
}

impl Inner {
    fn link(&mut self, entry: &CacheEntry) {
        for tag in entry.tags() {
            self.tags.entry(tag.clone()).or_default().insert(entry.key());
        }
    }

    fn unlink(&mut self, entry: &CacheEntry) {
        self.size = self.size.saturating_sub(entry.size());
        for tag in entry.tags() {
            if let Some(bucket) = self.tags.get_mut(tag) {
                bucket.remove(&entry.key());
                if bucket.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn remove(&mut self, key: &KeyId) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.pop(key)?;
        self.unlink(&entry);
        Some(entry)
    }
}

/// In-process store with size-bounded LRU eviction.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    size_limit: usize,
}

impl MemoryStore {
    /// Creates a store holding at most `size_limit` bytes of entries
    /// (bodies plus headers).
    pub fn new(size_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                tags: HashMap::new(),
                size: 0,
            }),
            size_limit,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the size limit.
    pub fn total_size(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "total_size").size
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn get(&self, key: KeyId) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        Ok(mutex_lock(&self.inner, SOURCE, "get").entries.get(&key).cloned())
    }

    async fn put(&self, entry: Arc<CacheEntry>) -> Result<(), CacheError> {
        let size = entry.size();
        if size > self.size_limit {
            debug!(
                cache = "output",
                key = %entry.key(),
                size,
                size_limit = self.size_limit,
                "entry exceeds store size limit; not stored"
            );
            return Ok(());
        }

        let mut inner = mutex_lock(&self.inner, SOURCE, "put");
        if let Some((_, replaced)) = inner.entries.push(entry.key(), Arc::clone(&entry)) {
            inner.unlink(&replaced);
        }
        inner.link(&entry);
        inner.size += size;

        let mut evicted = 0usize;
        while inner.size > self.size_limit {
            let Some((_, lru)) = inner.entries.pop_lru() else {
                break;
            };
            inner.unlink(&lru);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(cache = "output", evicted, reason = "capacity", "evicted entries");
        }
        Ok(())
    }

    async fn evict_by_key(&self, key: KeyId) -> Result<bool, CacheError> {
        Ok(mutex_lock(&self.inner, SOURCE, "evict_by_key")
            .remove(&key)
            .is_some())
    }

    async fn evict_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "evict_by_tag");
        let Some(members) = inner.tags.remove(tag) else {
            return Ok(0);
        };
        let evicted = members
            .iter()
            .filter(|key| inner.remove(key).is_some())
            .count();
        Ok(evicted)
    }

    async fn sweep(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "sweep");
        let expired: Vec<KeyId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh_at(now))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        Ok(expired.len())
    }
}

/// Runs [`EntryStore::sweep`] every `period` until the task is aborted.
pub fn spawn_sweeper(store: Arc<dyn EntryStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.sweep().await {
                Ok(0) => {}
                Ok(evicted) => debug!(cache = "output", evicted, reason = "expired", "swept entries"),
                Err(e) => warn!(cache = "output", error = %e, "expiration sweep failed"),
            }
        }
    })
}
