//! Lookup cache
//!
//! Entries are keyed by `(type, value)` and hold one timestamped partial
//! record per source. Freshness is decided by the engine against each
//! source's TTL; the stores only keep and evict.

mod memory;
mod remote;

pub use self::memory::MemoryCache;
pub use self::remote::{RedisStore, RemoteStore, TwoTierCache};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use thiserror::Error;
use wise_common::IndicatorType;

use crate::record::PartialRecord;

/// Cache-tier failures. Callers treat all of these as a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Remote store I/O failed
    #[error("remote store error: {0}")]
    Remote(String),

    /// Stored blob could not be decoded
    #[error("malformed cache entry: {0}")]
    Malformed(&'static str),

    /// Entry does not fit the blob layout
    #[error("cache entry too large: {0}")]
    TooLarge(&'static str),
}

impl From<::redis::RedisError> for CacheError {
    fn from(err: ::redis::RedisError) -> Self {
        CacheError::Remote(err.to_string())
    }
}

/// One source's cached answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult {
    /// Fetch time in seconds
    pub ts: u64,
    /// What the source returned
    pub record: PartialRecord,
}

/// Everything cached for one indicator, by source name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    results: HashMap<String, CachedResult>,
}

impl CacheEntry {
    /// Create empty entry
    pub fn new() -> Self {
        Self::default()
    }

    /// Sub-entry for `source`
    pub fn get(&self, source: &str) -> Option<&CachedResult> {
        self.results.get(source)
    }

    /// Replace the sub-entry for `source`
    pub fn insert(&mut self, source: impl Into<String>, ts: u64, record: PartialRecord) {
        self.results.insert(source.into(), CachedResult { ts, record });
    }

    /// Drop the sub-entry for `source`
    pub fn remove(&mut self, source: &str) -> Option<CachedResult> {
        self.results.remove(source)
    }

    /// Number of sources with a sub-entry
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Iterate `(source, result)`
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CachedResult)> {
        self.results.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Binary form used by remote stores
    pub fn to_bytes(&self) -> Result<Bytes, CacheError> {
        let n = u8::try_from(self.results.len())
            .map_err(|_| CacheError::TooLarge("more than 255 sources"))?;
        let mut buf = BytesMut::new();
        buf.put_u8(n);
        for (source, cached) in &self.results {
            let payload = cached.record.payload();
            let name_len =
                u16::try_from(source.len()).map_err(|_| CacheError::TooLarge("source name"))?;
            let payload_len =
                u16::try_from(payload.len()).map_err(|_| CacheError::TooLarge("payload"))?;
            buf.put_u16(name_len);
            buf.put_slice(source.as_bytes());
            buf.put_u64(cached.ts);
            buf.put_u8(cached.record.count());
            buf.put_u16(payload_len);
            buf.put_slice(payload);
        }
        Ok(buf.freeze())
    }

    /// Parse [`to_bytes`](Self::to_bytes) output
    pub fn from_bytes(mut buf: Bytes) -> Result<Self, CacheError> {
        fn need(buf: &Bytes, n: usize) -> Result<(), CacheError> {
            if buf.remaining() < n {
                Err(CacheError::Malformed("truncated"))
            } else {
                Ok(())
            }
        }

        need(&buf, 1)?;
        let n = buf.get_u8();
        let mut entry = CacheEntry::new();
        for _ in 0..n {
            need(&buf, 2)?;
            let name_len = buf.get_u16() as usize;
            need(&buf, name_len + 8 + 1 + 2)?;
            let name = String::from_utf8(buf.split_to(name_len).to_vec())
                .map_err(|_| CacheError::Malformed("source name"))?;
            let ts = buf.get_u64();
            let count = buf.get_u8();
            let payload_len = buf.get_u16() as usize;
            need(&buf, payload_len)?;
            let record = PartialRecord::from_parts(count, buf.split_to(payload_len))
                .map_err(|_| CacheError::Malformed("record"))?;
            entry.insert(name, ts, record);
        }
        if buf.has_remaining() {
            return Err(CacheError::Malformed("trailing bytes"));
        }
        Ok(entry)
    }
}

/// Key used by flat key-value stores
pub fn cache_key(itype: IndicatorType, value: &str) -> String {
    format!("{}-{}", itype.name(), value)
}

/// Store for cache entries
#[async_trait]
pub trait LookupCache: Send + Sync {
    /// Fetch the entry for an indicator. Failures read as `None`.
    async fn get(&self, itype: IndicatorType, value: &str) -> Option<CacheEntry>;

    /// Store the entry for an indicator
    async fn set(&self, itype: IndicatorType, value: &str, entry: CacheEntry);

    /// Entries currently held in process, for stats
    fn local_len(&self) -> usize;

    /// Snapshot of the in-process entries for one type
    fn local_entries(&self, itype: IndicatorType) -> Vec<(String, CacheEntry)>;
}
