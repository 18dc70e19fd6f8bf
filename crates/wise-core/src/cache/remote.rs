//! Two-tier cache: the LRU in front of a remote key-value store

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, warn};
use wise_common::IndicatorType;

use super::{cache_key, CacheEntry, CacheError, LookupCache, MemoryCache};

/// Persistent key-value store behind the LRU
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read a blob
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Write a blob, optionally expiring after `expire_secs`
    async fn store(&self, key: &str, blob: Bytes, expire_secs: Option<u64>) -> Result<(), CacheError>;
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url`, e.g. `redis://127.0.0.1/`
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.conn.clone();
        let blob: Option<Vec<u8>> = conn.get(key).await?;
        Ok(blob.map(Bytes::from))
    }

    async fn store(&self, key: &str, blob: Bytes, expire_secs: Option<u64>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match expire_secs {
            Some(secs) => {
                let _: () = conn.set_ex(key, blob.as_ref(), secs).await?;
            }
            None => {
                let _: () = conn.set(key, blob.as_ref()).await?;
            }
        }
        Ok(())
    }
}

/// LRU hot tier with write-through to a [`RemoteStore`]
pub struct TwoTierCache<R: RemoteStore> {
    local: MemoryCache,
    remote: Arc<R>,
    expire_secs: Option<u64>,
}

impl<R: RemoteStore> TwoTierCache<R> {
    /// Create with `capacity` local entries per type
    pub fn new(remote: Arc<R>, capacity: usize, expire_secs: Option<u64>) -> Self {
        Self {
            local: MemoryCache::new(capacity),
            remote,
            expire_secs,
        }
    }

    /// The local tier
    pub fn local(&self) -> &MemoryCache {
        &self.local
    }

    async fn fetch_remote(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.remote.fetch(key).await? {
            Some(blob) => CacheEntry::from_bytes(blob).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<R: RemoteStore> LookupCache for TwoTierCache<R> {
    async fn get(&self, itype: IndicatorType, value: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.local.get_sync(itype, value) {
            return Some(entry);
        }

        let key = cache_key(itype, value);
        match self.fetch_remote(&key).await {
            Ok(Some(entry)) => {
                debug!("Remote cache hit {}", key);
                self.local.put_sync(itype, value, entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Remote cache read {} failed: {}", key, e);
                None
            }
        }
    }

    async fn set(&self, itype: IndicatorType, value: &str, entry: CacheEntry) {
        let blob = entry.to_bytes();
        self.local.put_sync(itype, value, entry);

        let key = cache_key(itype, value);
        let blob = match blob {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Remote cache write {} skipped: {}", key, e);
                return;
            }
        };
        let remote = self.remote.clone();
        let expire = self.expire_secs;
        tokio::spawn(async move {
            if let Err(e) = remote.store(&key, blob, expire).await {
                warn!("Remote cache write {} failed: {}", key, e);
            }
        });
    }

    fn local_len(&self) -> usize {
        self.local.local_len()
    }

    fn local_entries(&self, itype: IndicatorType) -> Vec<(String, CacheEntry)> {
        self.local.entries(itype)
    }
}
