//! The owned registry handed to the engine and the gateway
//!
//! Holds the field table, the sources in registration order, the global
//! exclude lists and the pass-through view/right-click blobs. Sources are
//! added during startup through `&mut self`; afterwards the registry is
//! shared read-only behind an `Arc`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use wise_common::{Clock, IndicatorType, SystemClock};

use crate::fields::{FieldRegistry, RegistryError};
use crate::filter::{FilterError, FilterSet};
use crate::source::Source;

/// Descriptor registered before any source so the table is never empty
pub const TAGS_FIELD: &str = "field:tags";

/// Sources, fields and global filters
pub struct Registry {
    fields: Arc<FieldRegistry>,
    sources: Vec<Arc<Source>>,
    by_type: [Vec<usize>; IndicatorType::COUNT],
    global_deny: FilterSet,
    views: BTreeMap<String, Value>,
    right_clicks: BTreeMap<String, Value>,
}

impl Registry {
    /// Create on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create with an explicit clock for field versions
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let fields = Arc::new(FieldRegistry::with_clock(clock));
        // Cannot fail on an empty table
        let _ = fields.register(TAGS_FIELD);
        Self {
            fields,
            sources: Vec::new(),
            by_type: Default::default(),
            global_deny: FilterSet::new(),
            views: BTreeMap::new(),
            right_clicks: BTreeMap::new(),
        }
    }

    /// Shared field table
    pub fn fields(&self) -> &Arc<FieldRegistry> {
        &self.fields
    }

    /// Shorthand for `fields().register(..)`
    pub fn register_field(&self, descriptor: &str) -> Result<u8, RegistryError> {
        self.fields.register(descriptor)
    }

    /// Add a source. Its types decide which lookups fan out to it.
    pub fn register_source(&mut self, source: Source) -> Result<Arc<Source>, RegistryError> {
        if self.source(source.name()).is_some() {
            return Err(RegistryError::DuplicateSource(source.name().to_string()));
        }

        let idx = self.sources.len();
        let types = source.types();
        for itype in &types {
            self.by_type[itype.index()].push(idx);
        }
        if let Some(view) = source.view() {
            self.views
                .insert(source.name().to_string(), Value::String(view.to_string()));
        }

        info!(
            "Registered source {} types:{:?} ttl:{:?}",
            source.name(),
            types,
            source.ttl()
        );
        let source = Arc::new(source);
        self.sources.push(source.clone());
        Ok(source)
    }

    /// Install the global exclude list for one type
    pub fn set_global_deny<S: AsRef<str>>(
        &mut self,
        itype: IndicatorType,
        entries: &[S],
    ) -> Result<(), FilterError> {
        self.global_deny.set(itype, entries)
    }

    /// True if `value` is on the global exclude list for `itype`
    pub fn globally_denied(&self, itype: IndicatorType, value: &str) -> bool {
        self.global_deny.matches(itype, value)
    }

    /// Sources answering `itype`, in registration order, with their index
    pub fn sources_for(&self, itype: IndicatorType) -> impl Iterator<Item = (usize, &Arc<Source>)> {
        self.by_type[itype.index()]
            .iter()
            .map(move |&idx| (idx, &self.sources[idx]))
    }

    /// Source by name, with its index
    pub fn source_entry(&self, name: &str) -> Option<(usize, &Arc<Source>)> {
        self.sources
            .iter()
            .enumerate()
            .find(|(_, s)| s.name() == name)
    }

    /// Source by name
    pub fn source(&self, name: &str) -> Option<&Arc<Source>> {
        self.source_entry(name).map(|(_, s)| s)
    }

    /// All sources in registration order
    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Source names, sorted
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|s| s.name().to_string()).collect();
        names.sort();
        names
    }

    /// Types with at least one source, in wire order
    pub fn types(&self) -> Vec<IndicatorType> {
        IndicatorType::ALL
            .iter()
            .copied()
            .filter(|t| !self.by_type[t.index()].is_empty())
            .collect()
    }

    /// Add a view blob
    pub fn add_view(&mut self, name: impl Into<String>, view: Value) {
        self.views.insert(name.into(), view);
    }

    /// Views, by name
    pub fn views(&self) -> &BTreeMap<String, Value> {
        &self.views
    }

    /// Add a right-click (value action) blob
    pub fn add_right_click(&mut self, name: impl Into<String>, action: Value) {
        self.right_clicks.insert(name.into(), action);
    }

    /// Right-clicks, by name
    pub fn right_clicks(&self) -> &BTreeMap<String, Value> {
        &self.right_clicks
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{LookupKey, LookupResult};

    fn source(name: &str, types: &[IndicatorType]) -> Source {
        let mut builder = Source::builder(name);
        for t in types {
            builder = builder.handler(*t, |_key: LookupKey| async { LookupResult::Ok(None) });
        }
        builder.build()
    }

    #[test]
    fn test_tags_field_first() {
        let registry = Registry::new();
        assert_eq!(registry.fields().id_of("tags"), Some(0));
        assert_eq!(registry.register_field("field:other").unwrap(), 1);
    }

    #[test]
    fn test_sources_by_type_in_order() {
        let mut registry = Registry::new();
        registry
            .register_source(source("b", &[IndicatorType::Ip, IndicatorType::Domain]))
            .unwrap();
        registry.register_source(source("a", &[IndicatorType::Ip])).unwrap();
        let viewed = Source::builder("c")
            .handler(IndicatorType::Email, |_key: LookupKey| async {
                LookupResult::Ok(None)
            })
            .view("v")
            .build();
        registry.register_source(viewed).unwrap();

        let ip: Vec<&str> = registry
            .sources_for(IndicatorType::Ip)
            .map(|(_, s)| s.name())
            .collect();
        assert_eq!(ip, vec!["b", "a"]);
        assert_eq!(registry.source_names(), vec!["a", "b", "c"]);
        assert_eq!(
            registry.types(),
            vec![IndicatorType::Ip, IndicatorType::Domain, IndicatorType::Email]
        );
        assert_eq!(registry.source_entry("a").map(|(i, _)| i), Some(1));
        assert_eq!(registry.views().get("c"), Some(&Value::String("v".into())));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut registry = Registry::new();
        registry.register_source(source("a", &[IndicatorType::Ip])).unwrap();
        assert_eq!(
            registry.register_source(source("a", &[IndicatorType::Url])).unwrap_err(),
            RegistryError::DuplicateSource("a".into())
        );
        assert!(registry.types() == vec![IndicatorType::Ip]);
    }

    #[test]
    fn test_global_deny() {
        let mut registry = Registry::new();
        registry
            .set_global_deny(IndicatorType::Ip, &["10.0.0.0/8"])
            .unwrap();
        assert!(registry.globally_denied(IndicatorType::Ip, "10.0.0.5"));
        assert!(!registry.globally_denied(IndicatorType::Ip, "8.8.8.8"));
        assert!(registry
            .set_global_deny(IndicatorType::Ip, &["10.0.0.0/99"])
            .is_err());
    }
}
