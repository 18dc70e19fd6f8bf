//! Source contract
//!
//! A source is a named backend with one async lookup function per indicator
//! type it answers. Filtering, cache freshness and statistics are handled
//! here and by the engine, never by the backend itself.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWrite;
use wise_common::{AtomicCounter, IndicatorType, LatencyEwma};

use crate::filter::{FilterError, FilterSet};
use crate::record::PartialRecord;

/// Why a backend produced no record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Backend declined, e.g. too many outstanding requests
    #[error("request dropped")]
    Dropped,

    /// Backend failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Backend did not answer in time
    #[error("backend timed out")]
    Timeout,
}

/// `Ok(None)` is a clean miss
pub type LookupResult = Result<Option<PartialRecord>, SourceError>;

/// Per-type lookup function
pub type LookupFn = Arc<dyn Fn(LookupKey) -> BoxFuture<'static, LookupResult> + Send + Sync>;

/// What a backend is asked about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    /// Indicator value, without any content-type suffix
    pub value: String,
    /// Content type supplied with a hash, as in `hash;application/pdf`
    pub content_type: Option<String>,
}

impl LookupKey {
    /// Plain key
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            content_type: None,
        }
    }

    /// Split `hash;content-type` for hash types, pass everything else through
    pub fn parse(itype: IndicatorType, raw: &str) -> Self {
        if itype.is_hash() {
            if let Some((hash, ctype)) = raw.split_once(';') {
                return Self {
                    value: hash.to_string(),
                    content_type: Some(ctype.to_string()),
                };
            }
        }
        Self::new(raw)
    }
}

/// How long a source's sub-entries stay fresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "secs")]
pub enum CacheTtl {
    /// Never written to the cache
    Never,
    /// Fresh while younger than this many seconds. 0 always refetches.
    Seconds(u64),
    /// Fetched once, then served from cache until evicted
    Forever,
}

impl CacheTtl {
    /// Map the `cache_age_min` / `dont_cache` config keys
    pub fn from_config(cache_age_min: i64, dont_cache: bool) -> Self {
        if dont_cache {
            CacheTtl::Never
        } else if cache_age_min < 0 {
            CacheTtl::Forever
        } else {
            CacheTtl::Seconds(cache_age_min as u64 * 60)
        }
    }

    /// Whether a sub-entry stamped at `ts` can be served at `now`
    pub fn is_fresh(&self, ts: u64, now: u64) -> bool {
        match self {
            CacheTtl::Never => false,
            CacheTtl::Forever => true,
            CacheTtl::Seconds(ttl) => now.saturating_sub(ts) < *ttl,
        }
    }

    /// Whether results may be written back
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, CacheTtl::Never)
    }
}

impl Default for CacheTtl {
    fn default() -> Self {
        CacheTtl::Seconds(3600)
    }
}

/// Optional operator capability behind `/dump/:source`
#[async_trait]
pub trait SourceDump: Send + Sync {
    /// Write everything the source holds, in whatever text form it likes
    async fn dump(&self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> std::io::Result<()>;
}

/// Running counters
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Lookups that reached this source past the filters
    pub requests: AtomicCounter,
    /// Served from a fresh sub-entry
    pub cache_hits: AtomicCounter,
    /// No sub-entry existed
    pub cache_misses: AtomicCounter,
    /// A stale sub-entry existed
    pub cache_refreshes: AtomicCounter,
    /// Backend returned a record
    pub direct_hits: AtomicCounter,
    /// Backend signalled backpressure
    pub dropped: AtomicCounter,
    /// Backend failed or timed out
    pub errors: AtomicCounter,
    /// Fetch latency
    pub latency_ms: LatencyEwma,
}

/// Point-in-time copy of [`SourceStats`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceStatsSnapshot {
    pub source: String,
    pub types: Vec<IndicatorType>,
    pub request: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub cache_refresh: u64,
    pub direct_hit: u64,
    pub request_dropped: u64,
    pub error: u64,
    pub average_ms: f64,
}

/// A registered backend
pub struct Source {
    name: String,
    handlers: HashMap<IndicatorType, LookupFn>,
    ttl: CacheTtl,
    deny: FilterSet,
    allow: FilterSet,
    dump: Option<Arc<dyn SourceDump>>,
    view: Option<String>,
    stats: SourceStats,
}

impl Source {
    /// Start building a source called `name`
    pub fn builder(name: impl Into<String>) -> SourceBuilder {
        SourceBuilder {
            source: Source {
                name: name.into(),
                handlers: HashMap::new(),
                ttl: CacheTtl::default(),
                deny: FilterSet::new(),
                allow: FilterSet::new(),
                dump: None,
                view: None,
                stats: SourceStats::default(),
            },
        }
    }

    /// Config section name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache policy
    pub fn ttl(&self) -> CacheTtl {
        self.ttl
    }

    /// Lookup function for `itype`
    pub fn handler(&self, itype: IndicatorType) -> Option<&LookupFn> {
        self.handlers.get(&itype)
    }

    /// True if this source answers `itype`
    pub fn answers(&self, itype: IndicatorType) -> bool {
        self.handlers.contains_key(&itype)
    }

    /// Answered types, in wire order
    pub fn types(&self) -> Vec<IndicatorType> {
        IndicatorType::ALL
            .iter()
            .copied()
            .filter(|t| self.answers(*t))
            .collect()
    }

    /// Deny list wins over the allow list; a non-empty allow list must match
    pub fn allows(&self, itype: IndicatorType, value: &str) -> bool {
        if self.deny.matches(itype, value) {
            return false;
        }
        match self.allow.get(itype) {
            Some(allow) => allow.matches(value),
            None => true,
        }
    }

    /// Dump capability
    pub fn dumper(&self) -> Option<&Arc<dyn SourceDump>> {
        self.dump.as_ref()
    }

    /// View fragment
    pub fn view(&self) -> Option<&str> {
        self.view.as_deref()
    }

    /// Counters
    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Counters as plain numbers
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        let s = &self.stats;
        SourceStatsSnapshot {
            source: self.name.clone(),
            types: self.types(),
            request: s.requests.get(),
            cache_hit: s.cache_hits.get(),
            cache_miss: s.cache_misses.get(),
            cache_refresh: s.cache_refreshes.get(),
            direct_hit: s.direct_hits.get(),
            request_dropped: s.dropped.get(),
            error: s.errors.get(),
            average_ms: s.latency_ms.get(),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("types", &self.types())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Builder for [`Source`]
pub struct SourceBuilder {
    source: Source,
}

impl SourceBuilder {
    /// Cache policy
    pub fn ttl(mut self, ttl: CacheTtl) -> Self {
        self.source.ttl = ttl;
        self
    }

    /// Install a boxed lookup function for `itype`
    pub fn handler_fn(mut self, itype: IndicatorType, f: LookupFn) -> Self {
        self.source.handlers.insert(itype, f);
        self
    }

    /// Install an async closure as the lookup function for `itype`
    pub fn handler<F, Fut>(self, itype: IndicatorType, f: F) -> Self
    where
        F: Fn(LookupKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LookupResult> + Send + 'static,
    {
        self.handler_fn(itype, Arc::new(move |key| Box::pin(f(key))))
    }

    /// Deny list for `itype`
    pub fn deny<S: AsRef<str>>(
        mut self,
        itype: IndicatorType,
        entries: &[S],
    ) -> Result<Self, FilterError> {
        self.source.deny.set(itype, entries)?;
        Ok(self)
    }

    /// Allow list for `itype`
    pub fn allow<S: AsRef<str>>(
        mut self,
        itype: IndicatorType,
        entries: &[S],
    ) -> Result<Self, FilterError> {
        self.source.allow.set(itype, entries)?;
        Ok(self)
    }

    /// Dump capability
    pub fn dump(mut self, dump: Arc<dyn SourceDump>) -> Self {
        self.source.dump = Some(dump);
        self
    }

    /// View fragment served by `/views`
    pub fn view(mut self, view: impl Into<String>) -> Self {
        self.source.view = Some(view.into());
        self
    }

    /// Finish
    pub fn build(self) -> Source {
        self.source
    }
}
