//! Gateway configuration
//!
//! One JSON document. Every section and key is optional.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use wise_common::IndicatorType;
use wise_core::{CacheTtl, ValueLimits};

use crate::error::{GatewayError, GatewayResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener, deadline and global excludes
    pub service: ServiceConfig,
    /// Cache backend
    pub cache: CacheConfig,
    /// Value truncation
    pub record: RecordConfig,
    /// Opaque view blobs served by `/views`
    pub views: BTreeMap<String, Value>,
    /// Opaque value-action blobs served by `/rightClicks`
    pub right_clicks: BTreeMap<String, Value>,
    /// Source sections keyed `kind:instance`
    pub sources: BTreeMap<String, SourceConfig>,
}

impl GatewayConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a JSON document
    pub fn from_json(content: &str) -> GatewayResult<Self> {
        serde_json::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

/// `service` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
    /// Deadline for a whole `/get` batch
    pub request_timeout_ms: u64,
    #[serde(flatten)]
    pub exclude: ExcludeLists,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8081,
            request_timeout_ms: 5000,
            exclude: ExcludeLists::default(),
        }
    }
}

impl ServiceConfig {
    /// Listen address
    pub fn addr(&self) -> GatewayResult<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| GatewayError::Config(format!("bad bind address {:?}", self.bind)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Which cache implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Redis,
}

/// `cache` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub kind: CacheKind,
    /// Local LRU entries per indicator type
    pub cache_size: usize,
    pub redis_url: Option<String>,
    pub redis_expire_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            cache_size: 100_000,
            redis_url: None,
            redis_expire_secs: None,
        }
    }
}

/// `record` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub max_value_len: usize,
    pub truncate_to: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        let limits = ValueLimits::default();
        Self {
            max_value_len: limits.max_len,
            truncate_to: limits.truncate_to,
        }
    }
}

impl RecordConfig {
    pub fn limits(&self) -> ValueLimits {
        ValueLimits::new(self.max_value_len, self.truncate_to)
    }
}

/// `exclude_*` keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcludeLists {
    pub exclude_ips: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub exclude_md5s: Vec<String>,
    pub exclude_emails: Vec<String>,
    pub exclude_urls: Vec<String>,
    pub exclude_tuples: Vec<String>,
    pub exclude_ja3s: Vec<String>,
    pub exclude_sha256s: Vec<String>,
}

impl ExcludeLists {
    /// List for one type
    pub fn get(&self, itype: IndicatorType) -> &[String] {
        match itype {
            IndicatorType::Ip => &self.exclude_ips,
            IndicatorType::Domain => &self.exclude_domains,
            IndicatorType::Md5 => &self.exclude_md5s,
            IndicatorType::Email => &self.exclude_emails,
            IndicatorType::Url => &self.exclude_urls,
            IndicatorType::Tuple => &self.exclude_tuples,
            IndicatorType::Ja3 => &self.exclude_ja3s,
            IndicatorType::Sha256 => &self.exclude_sha256s,
        }
    }
}

/// `only_*` keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlyLists {
    pub only_ips: Vec<String>,
    pub only_domains: Vec<String>,
    pub only_md5s: Vec<String>,
    pub only_emails: Vec<String>,
    pub only_urls: Vec<String>,
    pub only_tuples: Vec<String>,
    pub only_ja3s: Vec<String>,
    pub only_sha256s: Vec<String>,
}

impl OnlyLists {
    /// List for one type
    pub fn get(&self, itype: IndicatorType) -> &[String] {
        match itype {
            IndicatorType::Ip => &self.only_ips,
            IndicatorType::Domain => &self.only_domains,
            IndicatorType::Md5 => &self.only_md5s,
            IndicatorType::Email => &self.only_emails,
            IndicatorType::Url => &self.only_urls,
            IndicatorType::Tuple => &self.only_tuples,
            IndicatorType::Ja3 => &self.only_ja3s,
            IndicatorType::Sha256 => &self.only_sha256s,
        }
    }
}

/// One source section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Minutes a result stays fresh, negative caches forever
    pub cache_age_min: i64,
    pub dont_cache: bool,
    #[serde(flatten)]
    pub exclude: ExcludeLists,
    #[serde(flatten)]
    pub only: OnlyLists,
    /// Field descriptors, `view:` lines are views
    pub fields: Vec<String>,
    pub view: Option<String>,

    // proxy
    pub url: Option<String>,
    pub types: Vec<IndicatorType>,
    pub max_outstanding: usize,
    pub timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cache_age_min: 60,
            dont_cache: false,
            exclude: ExcludeLists::default(),
            only: OnlyLists::default(),
            fields: Vec::new(),
            view: None,
            url: None,
            types: Vec::new(),
            max_outstanding: 100,
            timeout_ms: 5000,
        }
    }
}

impl SourceConfig {
    pub fn ttl(&self) -> CacheTtl {
        CacheTtl::from_config(self.cache_age_min, self.dont_cache)
    }

    /// Descriptor lines, without views
    pub fn field_descriptors(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(String::as_str)
            .filter(|f| !f.starts_with("view:"))
    }

    /// `view` plus every `view:` line in `fields`, joined by newlines
    pub fn combined_view(&self) -> Option<String> {
        let mut parts: Vec<&str> = self.view.iter().map(String::as_str).collect();
        parts.extend(self.fields.iter().filter_map(|f| f.strip_prefix("view:")));
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// `proxy:upstream` -> `proxy`
pub fn source_kind(section: &str) -> &str {
    section.split_once(':').map_or(section, |(kind, _)| kind)
}
