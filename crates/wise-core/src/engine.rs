//! Query engine
//!
//! One lookup runs: global filter, cache read, a per-source decision for
//! every source answering the type, concurrent resolution of those
//! decisions, merge in registration order, and cache write-back.

use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wise_common::{AtomicCounter, Clock, IndicatorType, SystemClock};

use crate::cache::{CacheEntry, LookupCache};
use crate::flight::SingleFlight;
use crate::record::{MergedRecord, PartialRecord};
use crate::registry::Registry;
use crate::source::{LookupKey, LookupResult, Source, SourceError, SourceStatsSnapshot};

/// Engine errors surfaced to the server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The request deadline passed before every lookup finished
    #[error("lookup deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// Named source does not exist
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// Named source does not answer this type
    #[error("source {0} does not answer {1}")]
    UnsupportedType(String, IndicatorType),
}

/// Typed indicator to look up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indicator {
    /// Type
    pub itype: IndicatorType,
    /// Raw value, hashes may carry `;content-type`
    pub value: String,
}

impl Indicator {
    /// Create indicator
    pub fn new(itype: IndicatorType, value: impl Into<String>) -> Self {
        Self {
            itype,
            value: value.into(),
        }
    }
}

/// Per-type counters
#[derive(Debug, Default)]
pub struct TypeStats {
    /// Lookups of this type
    pub requests: AtomicCounter,
    /// Lookups answered with at least one pair
    pub found: AtomicCounter,
    /// Lookups that found a cache entry
    pub cache_hits: AtomicCounter,
    /// Source sub-entries served from cache
    pub src_hits: AtomicCounter,
    /// Source sub-entries that did not exist
    pub src_misses: AtomicCounter,
    /// Source sub-entries that were stale
    pub src_refreshes: AtomicCounter,
}

/// Point-in-time copy of [`TypeStats`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TypeStatsSnapshot {
    pub name: IndicatorType,
    pub request: u64,
    pub found: u64,
    pub cache_hit: u64,
    pub cache_src_hit: u64,
    pub cache_src_miss: u64,
    pub cache_src_refresh: u64,
}

/// Everything `/stats` reports
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineStats {
    pub types: Vec<TypeStatsSnapshot>,
    pub sources: Vec<SourceStatsSnapshot>,
    pub cache_entries: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    source: usize,
    itype: IndicatorType,
    value: String,
}

enum Decision {
    SourceFiltered,
    UseCached(PartialRecord),
    Fetch(usize, Arc<Source>),
}

struct Resolved {
    record: Option<PartialRecord>,
    /// Set when this lookup ran the fetch itself, rather than joining one
    /// or reading the cache
    fetched_by: Option<Arc<Source>>,
}

impl Resolved {
    fn absent() -> Self {
        Self {
            record: None,
            fetched_by: None,
        }
    }
}

/// Cache-and-fan-out lookup engine
pub struct QueryEngine {
    registry: Arc<Registry>,
    cache: Arc<dyn LookupCache>,
    clock: Arc<dyn Clock>,
    flights: SingleFlight<FlightKey, LookupResult>,
    type_stats: [TypeStats; IndicatorType::COUNT],
}

impl QueryEngine {
    /// Create engine on the system clock
    pub fn new(registry: Arc<Registry>, cache: Arc<dyn LookupCache>) -> Self {
        Self::with_clock(registry, cache, Arc::new(SystemClock))
    }

    /// Create engine with an explicit clock for cache freshness
    pub fn with_clock(
        registry: Arc<Registry>,
        cache: Arc<dyn LookupCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            cache,
            clock,
            flights: SingleFlight::new(),
            type_stats: Default::default(),
        }
    }

    /// Registry the engine serves
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Look one indicator up across every source answering its type
    pub async fn lookup(&self, itype: IndicatorType, raw: &str) -> MergedRecord {
        let sources: Vec<(usize, Arc<Source>)> = self
            .registry
            .sources_for(itype)
            .map(|(i, s)| (i, s.clone()))
            .collect();
        self.run(itype, raw, sources).await
    }

    /// Look one indicator up in a single named source
    pub async fn lookup_in(
        &self,
        source: &str,
        itype: IndicatorType,
        raw: &str,
    ) -> Result<MergedRecord, EngineError> {
        let (idx, src) = self
            .registry
            .source_entry(source)
            .ok_or_else(|| EngineError::UnknownSource(source.to_string()))?;
        if !src.answers(itype) {
            return Err(EngineError::UnsupportedType(source.to_string(), itype));
        }
        let sources = vec![(idx, src.clone())];
        Ok(self.run(itype, raw, sources).await)
    }

    /// [`lookup_in`](Self::lookup_in) on its own task under `deadline`.
    ///
    /// Missing the deadline abandons the wait only. The lookup finishes and
    /// writes its results back.
    pub async fn lookup_in_within(
        self: &Arc<Self>,
        source: &str,
        itype: IndicatorType,
        raw: &str,
        deadline: Duration,
    ) -> Result<MergedRecord, EngineError> {
        let engine = self.clone();
        let (source, raw) = (source.to_string(), raw.to_string());
        let handle = tokio::spawn(async move { engine.lookup_in(&source, itype, &raw).await });

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Ok(Err(_)) => Ok(MergedRecord::empty()),
            Err(_) => Err(EngineError::Timeout(deadline)),
        }
    }

    /// Look a batch up concurrently, answering in request order.
    ///
    /// `None` items (unknown types) get the empty record. Each lookup runs on
    /// its own task, so missing the deadline abandons the wait but lets the
    /// lookups finish and populate the cache.
    pub async fn lookup_batch(
        self: &Arc<Self>,
        items: Vec<Option<Indicator>>,
        deadline: Duration,
    ) -> Result<Vec<MergedRecord>, EngineError> {
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                item.map(|ind| {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let record = engine.lookup(ind.itype, &ind.value).await;
                        if record.count() > 0 {
                            engine.type_stats[ind.itype.index()].found.inc();
                        }
                        record
                    })
                })
            })
            .collect();

        let joined = join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Some(handle) => match handle.await {
                    Ok(record) => record,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(_) => MergedRecord::empty(),
                },
                None => MergedRecord::empty(),
            }
        }));

        tokio::time::timeout(deadline, joined)
            .await
            .map_err(|_| EngineError::Timeout(deadline))
    }

    async fn run(
        &self,
        itype: IndicatorType,
        raw: &str,
        sources: Vec<(usize, Arc<Source>)>,
    ) -> MergedRecord {
        let tstats = &self.type_stats[itype.index()];
        tstats.requests.inc();

        let key = LookupKey::parse(itype, raw);
        if self.registry.globally_denied(itype, &key.value) {
            debug!("Globally excluded {} {}", itype, key.value);
            return MergedRecord::empty();
        }

        let entry = match self.cache.get(itype, &key.value).await {
            Some(entry) => {
                tstats.cache_hits.inc();
                entry
            }
            None => CacheEntry::new(),
        };
        let now = self.clock.now_secs();

        let decisions: Vec<Decision> = sources
            .into_iter()
            .map(|(idx, src)| self.decide(itype, &key, idx, src, &entry, now))
            .collect();

        let resolved = join_all(decisions.into_iter().map(|decision| {
            let key = key.clone();
            async move {
                match decision {
                    Decision::SourceFiltered => Resolved::absent(),
                    Decision::UseCached(record) => Resolved {
                        record: Some(record),
                        fetched_by: None,
                    },
                    Decision::Fetch(idx, src) => self.fetch(itype, key, idx, src).await,
                }
            }
        }))
        .await;

        let records: Vec<Option<&PartialRecord>> =
            resolved.iter().map(|r| r.record.as_ref()).collect();
        let merged = MergedRecord::merge(records.iter().copied())
            .unwrap_or_else(|_| MergedRecord::merge_fitting(records.iter().copied()));
        trace!("Result {} {} count:{}", itype, key.value, merged.count());

        self.write_back(itype, &key.value, &resolved, now).await;
        merged
    }

    fn decide(
        &self,
        itype: IndicatorType,
        key: &LookupKey,
        idx: usize,
        src: Arc<Source>,
        entry: &CacheEntry,
        now: u64,
    ) -> Decision {
        if !src.allows(itype, &key.value) {
            debug!("Source {} excluded {} {}", src.name(), itype, key.value);
            return Decision::SourceFiltered;
        }

        let tstats = &self.type_stats[itype.index()];
        let sstats = src.stats();
        sstats.requests.inc();

        let ttl = src.ttl();
        match entry.get(src.name()) {
            Some(cached) if ttl.is_fresh(cached.ts, now) => {
                sstats.cache_hits.inc();
                tstats.src_hits.inc();
                return Decision::UseCached(cached.record.clone());
            }
            Some(_) if ttl.is_cacheable() => {
                sstats.cache_refreshes.inc();
                tstats.src_refreshes.inc();
            }
            None if ttl.is_cacheable() => {
                sstats.cache_misses.inc();
                tstats.src_misses.inc();
            }
            // Uncached sources count as neither
            _ => {}
        }
        Decision::Fetch(idx, src)
    }

    async fn fetch(
        &self,
        itype: IndicatorType,
        key: LookupKey,
        idx: usize,
        src: Arc<Source>,
    ) -> Resolved {
        let handler = match src.handler(itype) {
            Some(handler) => handler.clone(),
            None => return Resolved::absent(),
        };

        let flight_key = FlightKey {
            source: idx,
            itype,
            value: key.value.clone(),
        };
        let task_src = src.clone();
        let flight = self
            .flights
            .run(flight_key, move || {
                let started = Instant::now();
                let value = key.value.clone();
                let pending = handler(key);
                async move {
                    let result = pending.await;
                    let stats = task_src.stats();
                    stats
                        .latency_ms
                        .record(started.elapsed().as_secs_f64() * 1000.0);
                    match &result {
                        Ok(Some(_)) => {
                            stats.direct_hits.inc();
                        }
                        Ok(None) => {}
                        Err(SourceError::Dropped) => {
                            stats.dropped.inc();
                        }
                        Err(e) => {
                            stats.errors.inc();
                            warn!("Source {} {} {} failed: {}", task_src.name(), itype, value, e);
                        }
                    }
                    result
                }
            })
            .await;

        match flight {
            Ok(flight) => Resolved {
                record: flight.value.ok().flatten(),
                fetched_by: (!flight.joined).then_some(src),
            },
            Err(e) => {
                warn!("Source {} {} lookup lost: {}", src.name(), itype, e);
                Resolved::absent()
            }
        }
    }

    /// Fold this lookup's own fetches into the entry as it stands now.
    ///
    /// The entry is read again so sub-entries written by concurrent lookups
    /// since the first read survive. Stale sub-entries whose refetch came
    /// back absent are dropped.
    async fn write_back(
        &self,
        itype: IndicatorType,
        value: &str,
        resolved: &[Resolved],
        now: u64,
    ) {
        let fetched: Vec<(&Arc<Source>, Option<&PartialRecord>)> = resolved
            .iter()
            .filter_map(|r| r.fetched_by.as_ref().map(|src| (src, r.record.as_ref())))
            .filter(|(src, _)| src.ttl().is_cacheable())
            .collect();
        if fetched.is_empty() {
            return;
        }

        let mut entry = self.cache.get(itype, value).await.unwrap_or_default();
        let mut changed = false;
        for (src, record) in fetched {
            match record {
                Some(record) => {
                    entry.insert(src.name(), now, record.clone());
                    changed = true;
                }
                None => {
                    let stale = entry
                        .get(src.name())
                        .is_some_and(|cached| !src.ttl().is_fresh(cached.ts, now));
                    if stale {
                        entry.remove(src.name());
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.cache.set(itype, value, entry).await;
        }
    }

    /// Results of one source held in the local cache tier, as
    /// `(type, value, timestamp, record)`
    pub fn cached_results(
        &self,
        source: &str,
    ) -> Result<Vec<(IndicatorType, String, u64, PartialRecord)>, EngineError> {
        let src = self
            .registry
            .source(source)
            .ok_or_else(|| EngineError::UnknownSource(source.to_string()))?;

        let mut out = Vec::new();
        for itype in src.types() {
            for (value, entry) in self.cache.local_entries(itype) {
                if let Some(cached) = entry.get(source) {
                    out.push((itype, value, cached.ts, cached.record.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Counters for every type and source
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            types: IndicatorType::ALL
                .iter()
                .map(|&t| {
                    let s = &self.type_stats[t.index()];
                    TypeStatsSnapshot {
                        name: t,
                        request: s.requests.get(),
                        found: s.found.get(),
                        cache_hit: s.cache_hits.get(),
                        cache_src_hit: s.src_hits.get(),
                        cache_src_miss: s.src_misses.get(),
                        cache_src_refresh: s.src_refreshes.get(),
                    }
                })
                .collect(),
            sources: self.registry.sources().iter().map(|s| s.snapshot()).collect(),
            cache_entries: self.cache.local_len(),
            in_flight: self.flights.len(),
        }
    }

    /// Counters for one type
    pub fn type_stats(&self, itype: IndicatorType) -> &TypeStats {
        &self.type_stats[itype.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::record::ValueLimits;
    use crate::source::CacheTtl;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use wise_common::ManualClock;

    struct Harness {
        engine: Arc<QueryEngine>,
        cache: Arc<MemoryCache>,
        clock: Arc<ManualClock>,
    }

    fn harness(registry: Registry) -> Harness {
        let cache = Arc::new(MemoryCache::new(100));
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = Arc::new(QueryEngine::with_clock(
            Arc::new(registry),
            cache.clone(),
            clock.clone(),
        ));
        Harness {
            engine,
            cache,
            clock,
        }
    }

    fn record(field: u8, value: &str) -> PartialRecord {
        PartialRecord::encode(&[(field, value)], &ValueLimits::default()).unwrap()
    }

    /// Source answering `itype` with one pair, counting calls
    fn counting(
        name: &str,
        itype: IndicatorType,
        ttl: CacheTtl,
        field: u8,
        calls: Arc<AtomicUsize>,
    ) -> Source {
        Source::builder(name)
            .ttl(ttl)
            .handler(itype, move |key: LookupKey| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { LookupResult::Ok(Some(record(field, &key.value))) }
            })
            .build()
    }

    fn single(source: Source) -> Harness {
        let mut registry = Registry::new();
        registry.register_source(source).unwrap();
        harness(registry)
    }

    #[tokio::test]
    async fn test_basic_hit_miss_and_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = single(counting(
            "s1",
            IndicatorType::Ip,
            CacheTtl::Seconds(60),
            1,
            calls.clone(),
        ));

        let first = h.engine.lookup(IndicatorType::Ip, "10.0.0.1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.decode().unwrap(), vec![(1, "10.0.0.1".to_string())]);

        h.clock.advance(59);
        let second = h.engine.lookup(IndicatorType::Ip, "10.0.0.1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second, first);

        h.clock.advance(1);
        h.engine.lookup(IndicatorType::Ip, "10.0.0.1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let entry = h.cache.get_sync(IndicatorType::Ip, "10.0.0.1").unwrap();
        assert_eq!(entry.get("s1").unwrap().ts, 1_060);

        let src = h.engine.registry().source("s1").unwrap().snapshot();
        assert_eq!(
            (src.request, src.cache_miss, src.cache_hit, src.cache_refresh),
            (3, 1, 1, 1)
        );
        assert_eq!(src.direct_hit, 2);

        let stats = h.engine.stats();
        let ip = &stats.types[IndicatorType::Ip.index()];
        assert_eq!((ip.request, ip.cache_hit, ip.cache_src_hit), (3, 2, 1));
        assert_eq!((ip.cache_src_miss, ip.cache_src_refresh), (1, 1));
    }

    #[tokio::test]
    async fn test_global_deny_touches_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry
            .set_global_deny(IndicatorType::Ip, &["10.0.0.0/8"])
            .unwrap();
        registry
            .register_source(counting(
                "s1",
                IndicatorType::Ip,
                CacheTtl::Seconds(60),
                1,
                calls.clone(),
            ))
            .unwrap();
        let h = harness(registry);

        let merged = h.engine.lookup(IndicatorType::Ip, "10.0.0.5").await;
        assert_eq!(merged, MergedRecord::empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(h.cache.get_sync(IndicatorType::Ip, "10.0.0.5").is_none());
        assert_eq!(h.engine.registry().source("s1").unwrap().snapshot().request, 0);
    }

    #[tokio::test]
    async fn test_deny_wins_over_allow() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let source = Source::builder("s1")
            .handler(IndicatorType::Domain, move |key: LookupKey| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { LookupResult::Ok(Some(record(1, &key.value))) }
            })
            .deny(IndicatorType::Domain, &["bad.example.com"])
            .unwrap()
            .allow(IndicatorType::Domain, &["*.example.com"])
            .unwrap()
            .build();
        let h = single(source);

        assert_eq!(
            h.engine.lookup(IndicatorType::Domain, "bad.example.com").await,
            MergedRecord::empty()
        );
        assert_eq!(
            h.engine.lookup(IndicatorType::Domain, "other.net").await,
            MergedRecord::empty()
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let ok = h.engine.lookup(IndicatorType::Domain, "good.example.com").await;
        assert_eq!(ok.count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (c, g) = (calls.clone(), gate.clone());
        let source = Source::builder("slow")
            .ttl(CacheTtl::Seconds(0))
            .handler(IndicatorType::Domain, move |key: LookupKey| {
                c.fetch_add(1, Ordering::SeqCst);
                let g = g.clone();
                async move {
                    g.notified().await;
                    LookupResult::Ok(Some(record(2, &key.value)))
                }
            })
            .build();
        let h = single(source);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = h.engine.clone();
            tasks.push(tokio::spawn(async move {
                engine.lookup(IndicatorType::Domain, "evil.com").await
            }));
        }
        while h.engine.stats().in_flight == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == results[0]));
        assert_eq!(results[0].count(), 1);
        assert_eq!(h.engine.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_drop_signal() {
        let mut registry = Registry::new();
        registry
            .register_source(
                Source::builder("busy")
                    .handler(IndicatorType::Ip, |_key: LookupKey| async {
                        LookupResult::Err(SourceError::Dropped)
                    })
                    .build(),
            )
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register_source(counting(
                "ok",
                IndicatorType::Ip,
                CacheTtl::Seconds(60),
                3,
                calls,
            ))
            .unwrap();
        let h = harness(registry);

        let merged = h.engine.lookup(IndicatorType::Ip, "1.2.3.4").await;
        assert_eq!(merged.decode().unwrap(), vec![(3, "1.2.3.4".to_string())]);

        let busy = h.engine.registry().source("busy").unwrap().snapshot();
        assert_eq!(busy.request_dropped, 1);
        assert_eq!(busy.error, 0);

        let entry = h.cache.get_sync(IndicatorType::Ip, "1.2.3.4").unwrap();
        assert!(entry.get("busy").is_none());
        assert!(entry.get("ok").is_some());
    }

    #[tokio::test]
    async fn test_backend_error_is_absent() {
        let mut registry = Registry::new();
        registry
            .register_source(
                Source::builder("broken")
                    .handler(IndicatorType::Email, |_key: LookupKey| async {
                        LookupResult::Err(SourceError::Backend("connection refused".into()))
                    })
                    .build(),
            )
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register_source(counting(
                "ok",
                IndicatorType::Email,
                CacheTtl::Seconds(60),
                4,
                calls,
            ))
            .unwrap();
        let h = harness(registry);

        let merged = h.engine.lookup(IndicatorType::Email, "a@b.c").await;
        assert_eq!(merged.count(), 1);
        assert_eq!(h.engine.registry().source("broken").unwrap().snapshot().error, 1);
    }

    #[tokio::test]
    async fn test_merge_follows_registration_order() {
        let mut registry = Registry::new();
        registry
            .register_source(
                Source::builder("slow")
                    .handler(IndicatorType::Url, |_key: LookupKey| async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        LookupResult::Ok(Some(record(1, "slow")))
                    })
                    .build(),
            )
            .unwrap();
        registry
            .register_source(
                Source::builder("empty")
                    .handler(IndicatorType::Url, |_key: LookupKey| async {
                        LookupResult::Ok(None)
                    })
                    .build(),
            )
            .unwrap();
        registry
            .register_source(
                Source::builder("fast")
                    .handler(IndicatorType::Url, |_key: LookupKey| async {
                        LookupResult::Ok(Some(record(2, "fast")))
                    })
                    .build(),
            )
            .unwrap();
        let h = harness(registry);

        let merged = h.engine.lookup(IndicatorType::Url, "http://x/").await;
        assert_eq!(
            merged.decode().unwrap(),
            vec![(1, "slow".to_string()), (2, "fast".to_string())]
        );
    }

    #[tokio::test]
    async fn test_never_and_forever_ttls() {
        let never_calls = Arc::new(AtomicUsize::new(0));
        let forever_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry
            .register_source(counting(
                "never",
                IndicatorType::Ja3,
                CacheTtl::Never,
                1,
                never_calls.clone(),
            ))
            .unwrap();
        registry
            .register_source(counting(
                "forever",
                IndicatorType::Ja3,
                CacheTtl::Forever,
                2,
                forever_calls.clone(),
            ))
            .unwrap();
        let h = harness(registry);

        for _ in 0..3 {
            h.engine.lookup(IndicatorType::Ja3, "abc").await;
            h.clock.advance(1_000_000);
        }
        assert_eq!(never_calls.load(Ordering::SeqCst), 3);
        assert_eq!(forever_calls.load(Ordering::SeqCst), 1);

        let entry = h.cache.get_sync(IndicatorType::Ja3, "abc").unwrap();
        assert!(entry.get("never").is_none());
        assert!(entry.get("forever").is_some());

        let never = h.engine.registry().source("never").unwrap().snapshot();
        assert_eq!((never.cache_miss, never.cache_refresh, never.cache_hit), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_hash_content_type() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        let source = Source::builder("hashes")
            .handler(IndicatorType::Md5, move |key: LookupKey| {
                s.lock().push(key.clone());
                async move { LookupResult::Ok(Some(record(1, "known"))) }
            })
            .build();
        let h = single(source);

        h.engine
            .lookup(IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e;application/pdf")
            .await;
        h.engine
            .lookup(IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e;text/plain")
            .await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(seen[0].content_type.as_deref(), Some("application/pdf"));
        assert!(h
            .cache
            .get_sync(IndicatorType::Md5, "d41d8cd98f00b204e9800998ecf8427e")
            .is_some());
    }

    #[tokio::test]
    async fn test_batch_keeps_request_order() {
        let mut registry = Registry::new();
        registry
            .register_source(
                Source::builder("echo")
                    .handler(IndicatorType::Domain, |key: LookupKey| async move {
                        if key.value == "slow.com" {
                            tokio::time::sleep(Duration::from_millis(40)).await;
                        }
                        LookupResult::Ok(Some(record(1, &key.value)))
                    })
                    .build(),
            )
            .unwrap();
        let h = harness(registry);

        let items = vec![
            Some(Indicator::new(IndicatorType::Domain, "a.com")),
            Some(Indicator::new(IndicatorType::Domain, "slow.com")),
            None,
            Some(Indicator::new(IndicatorType::Domain, "c.com")),
        ];
        let results = h
            .engine
            .lookup_batch(items, Duration::from_secs(5))
            .await
            .unwrap();

        let values: Vec<String> = results
            .iter()
            .map(|r| r.decode().unwrap().first().map(|p| p.1.clone()).unwrap_or_default())
            .collect();
        assert_eq!(values, vec!["a.com", "slow.com", "", "c.com"]);
        assert_eq!(results[2], MergedRecord::empty());
        assert_eq!(h.engine.type_stats(IndicatorType::Domain).found.get(), 3);
    }

    #[tokio::test]
    async fn test_deadline_does_not_cancel_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let source = Source::builder("slow")
            .handler(IndicatorType::Tuple, move |key: LookupKey| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    LookupResult::Ok(Some(record(1, &key.value)))
                }
            })
            .build();
        let h = single(source);

        let items = vec![Some(Indicator::new(IndicatorType::Tuple, "1;2;3"))];
        let err = h
            .engine
            .lookup_batch(items, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(5)));

        // The abandoned lookup still completes and fills the cache
        for _ in 0..100 {
            if h.cache.get_sync(IndicatorType::Tuple, "1;2;3").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.cache.get_sync(IndicatorType::Tuple, "1;2;3").is_some());

        let again = h.engine.lookup(IndicatorType::Tuple, "1;2;3").await;
        assert_eq!(again.count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookup_in_single_source() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry
            .register_source(counting(
                "a",
                IndicatorType::Sha256,
                CacheTtl::Seconds(60),
                1,
                a_calls.clone(),
            ))
            .unwrap();
        registry
            .register_source(counting(
                "b",
                IndicatorType::Sha256,
                CacheTtl::Seconds(60),
                2,
                b_calls.clone(),
            ))
            .unwrap();
        let h = harness(registry);

        let merged = h.engine.lookup_in("b", IndicatorType::Sha256, "ff").await.unwrap();
        assert_eq!(merged.decode().unwrap(), vec![(2, "ff".to_string())]);
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            h.engine.lookup_in("zz", IndicatorType::Sha256, "ff").await,
            Err(EngineError::UnknownSource("zz".into()))
        );
        assert!(matches!(
            h.engine.lookup_in("a", IndicatorType::Ip, "1.1.1.1").await,
            Err(EngineError::UnsupportedType(..))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_lookups_keep_each_others_results() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (c, g) = (a_calls.clone(), gate.clone());
        let mut registry = Registry::new();
        registry
            .register_source(
                Source::builder("a")
                    .ttl(CacheTtl::Seconds(60))
                    .handler(IndicatorType::Domain, move |key: LookupKey| {
                        c.fetch_add(1, Ordering::SeqCst);
                        let g = g.clone();
                        async move {
                            g.notified().await;
                            LookupResult::Ok(Some(record(1, &key.value)))
                        }
                    })
                    .build(),
            )
            .unwrap();
        registry
            .register_source(counting(
                "b",
                IndicatorType::Domain,
                CacheTtl::Seconds(60),
                2,
                b_calls.clone(),
            ))
            .unwrap();
        let h = harness(registry);

        // First lookup leads `a` and `b`, the second joins `a` and leads
        // its own `b` fetch
        let first = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.lookup(IndicatorType::Domain, "x.com").await })
        };
        while b_calls.load(Ordering::SeqCst) < 1 || h.engine.stats().in_flight != 1 {
            tokio::task::yield_now().await;
        }
        let second = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.lookup(IndicatorType::Domain, "x.com").await })
        };
        while b_calls.load(Ordering::SeqCst) < 2 || h.engine.stats().in_flight != 1 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();

        assert_eq!(first.await.unwrap().count(), 2);
        assert_eq!(second.await.unwrap().count(), 2);

        let entry = h.cache.get_sync(IndicatorType::Domain, "x.com").unwrap();
        assert!(entry.get("a").is_some());
        assert!(entry.get("b").is_some());

        h.clock.advance(30);
        let third = h.engine.lookup(IndicatorType::Domain, "x.com").await;
        assert_eq!(third.count(), 2);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_entry_dropped_when_refetch_is_absent() {
        let found = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let f = found.clone();
        let source = Source::builder("flaky")
            .ttl(CacheTtl::Seconds(60))
            .handler(IndicatorType::Ip, move |key: LookupKey| {
                let hit = f.load(Ordering::SeqCst);
                async move { LookupResult::Ok(hit.then(|| record(1, &key.value))) }
            })
            .build();
        let h = single(source);

        h.engine.lookup(IndicatorType::Ip, "1.1.1.1").await;
        assert!(h.cache.get_sync(IndicatorType::Ip, "1.1.1.1").is_some());

        found.store(false, Ordering::SeqCst);
        h.clock.advance(61);
        let merged = h.engine.lookup(IndicatorType::Ip, "1.1.1.1").await;
        assert_eq!(merged, MergedRecord::empty());
        let entry = h.cache.get_sync(IndicatorType::Ip, "1.1.1.1").unwrap();
        assert!(entry.get("flaky").is_none());
    }

    #[tokio::test]
    async fn test_single_source_deadline_keeps_write_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let source = Source::builder("slow")
            .handler(IndicatorType::Domain, move |key: LookupKey| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    LookupResult::Ok(Some(record(1, &key.value)))
                }
            })
            .build();
        let h = single(source);

        let err = h
            .engine
            .lookup_in_within("slow", IndicatorType::Domain, "a.com", Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(5)));

        for _ in 0..100 {
            if h.cache.get_sync(IndicatorType::Domain, "a.com").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.cache.get_sync(IndicatorType::Domain, "a.com").is_some());

        let again = h
            .engine
            .lookup_in_within("slow", IndicatorType::Domain, "a.com", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(again.count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            h.engine
                .lookup_in_within("nope", IndicatorType::Domain, "a.com", Duration::from_secs(1))
                .await,
            Err(EngineError::UnknownSource("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_cached_results_for_one_source() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = single(counting(
            "s1",
            IndicatorType::Domain,
            CacheTtl::Seconds(60),
            1,
            calls,
        ));

        h.engine.lookup(IndicatorType::Domain, "a.com").await;
        h.engine.lookup(IndicatorType::Domain, "b.com").await;

        let mut cached = h.engine.cached_results("s1").unwrap();
        cached.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].0, IndicatorType::Domain);
        assert_eq!(cached[0].1, "a.com");
        assert_eq!(cached[0].2, 1_000);
        assert_eq!(cached[1].3, record(1, "b.com"));

        assert_eq!(
            h.engine.cached_results("nope"),
            Err(EngineError::UnknownSource("nope".into()))
        );
    }
}
