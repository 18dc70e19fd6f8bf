//! WISE Core - Cache-and-fan-out lookup engine
//!
//! Clients ask about indicators (IPs, domains, hashes, ...). The engine asks
//! every registered source that answers the indicator's type, collapses
//! duplicate concurrent fetches, caches each source's answer under its own
//! TTL, and merges the answers into one compact record.
//!
//! # Modules
//!
//! - [`fields`]: field descriptor registry and its client exports
//! - [`record`]: partial/merged record codec
//! - [`filter`]: CIDR trie and wildcard allow/deny lists
//! - [`source`]: the backend contract and per-source statistics
//! - [`cache`]: in-process LRU and two-tier caches
//! - [`flight`]: single-flight request collapsing
//! - [`registry`]: the owned set of sources and fields
//! - [`engine`]: the lookup state machine

#![warn(clippy::all)]

pub mod cache;
pub mod engine;
pub mod fields;
pub mod filter;
pub mod flight;
pub mod record;
pub mod registry;
pub mod source;

pub use cache::{CacheEntry, CacheError, LookupCache, MemoryCache, TwoTierCache};
pub use engine::{EngineError, EngineStats, Indicator, QueryEngine};
pub use fields::{FieldDef, FieldRegistry, RegistryError};
pub use filter::{FilterError, FilterSet};
pub use record::{CodecError, MergedRecord, PartialRecord, ValueLimits};
pub use registry::Registry;
pub use source::{
    CacheTtl, LookupFn, LookupKey, LookupResult, Source, SourceDump, SourceError,
};
