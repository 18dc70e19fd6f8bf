//! In-process LRU tier

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use wise_common::IndicatorType;

use super::{CacheEntry, LookupCache};

/// One bounded LRU per indicator type
pub struct MemoryCache {
    tiers: Vec<Mutex<LruCache<String, CacheEntry>>>,
}

impl MemoryCache {
    /// Create cache holding up to `capacity` entries per type
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tiers: IndicatorType::ALL
                .iter()
                .map(|_| Mutex::new(LruCache::new(cap)))
                .collect(),
        }
    }

    /// Lookup, bumping recency
    pub fn get_sync(&self, itype: IndicatorType, value: &str) -> Option<CacheEntry> {
        self.tiers[itype.index()].lock().get(value).cloned()
    }

    /// Insert or replace, bumping recency
    pub fn put_sync(&self, itype: IndicatorType, value: &str, entry: CacheEntry) {
        self.tiers[itype.index()].lock().put(value.to_string(), entry);
    }

    /// Entries held for one type
    pub fn len_of(&self, itype: IndicatorType) -> usize {
        self.tiers[itype.index()].lock().len()
    }

    /// Snapshot of every `(value, entry)` held for one type
    pub fn entries(&self, itype: IndicatorType) -> Vec<(String, CacheEntry)> {
        self.tiers[itype.index()]
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl LookupCache for MemoryCache {
    async fn get(&self, itype: IndicatorType, value: &str) -> Option<CacheEntry> {
        self.get_sync(itype, value)
    }

    async fn set(&self, itype: IndicatorType, value: &str, entry: CacheEntry) {
        self.put_sync(itype, value, entry);
    }

    fn local_len(&self) -> usize {
        self.tiers.iter().map(|t| t.lock().len()).sum()
    }

    fn local_entries(&self, itype: IndicatorType) -> Vec<(String, CacheEntry)> {
        self.entries(itype)
    }
}
