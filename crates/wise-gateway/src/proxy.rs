//! Proxy source: answers lookups by asking another broker
//!
//! Each lookup is a one-item `/get` against the upstream. Upstream field IDs
//! mean nothing locally, so the upstream `/fields` table is fetched whenever
//! the version in a response changes and every upstream descriptor is
//! registered here on first sight.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use wise_common::IndicatorType;
use wise_core::source::SourceBuilder;
use wise_core::{
    FieldRegistry, Indicator, LookupKey, LookupResult, MergedRecord, PartialRecord, SourceError,
    ValueLimits,
};

use crate::config::SourceConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{decode_fields, decode_response, encode_batch};

#[derive(Default)]
struct UpstreamFields {
    version: Option<u32>,
    /// Upstream ID -> local ID
    local_ids: Vec<Option<u8>>,
}

/// Wire-protocol client of an upstream broker
pub struct ProxySource {
    name: String,
    base_url: String,
    types: Vec<IndicatorType>,
    client: reqwest::Client,
    fields: Arc<FieldRegistry>,
    limits: ValueLimits,
    upstream: RwLock<UpstreamFields>,
    refresh: Mutex<()>,
    outstanding: Semaphore,
}

impl ProxySource {
    /// Build from a `proxy:*` section
    pub fn new(
        name: &str,
        config: &SourceConfig,
        fields: Arc<FieldRegistry>,
        limits: ValueLimits,
    ) -> GatewayResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| GatewayError::Source(name.to_string(), "missing url".into()))?;
        if config.types.is_empty() {
            return Err(GatewayError::Source(name.to_string(), "no types".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| GatewayError::Source(name.to_string(), e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            base_url: url.trim_end_matches('/').to_string(),
            types: config.types.clone(),
            client,
            fields,
            limits,
            upstream: RwLock::new(UpstreamFields::default()),
            refresh: Mutex::new(()),
            outstanding: Semaphore::new(config.max_outstanding.max(1)),
        })
    }

    /// Install a handler for every configured type
    pub fn attach(self: Arc<Self>, mut builder: SourceBuilder) -> SourceBuilder {
        for &itype in &self.types {
            let proxy = self.clone();
            builder = builder.handler(itype, move |key: LookupKey| {
                let proxy = proxy.clone();
                async move { proxy.lookup(itype, key).await }
            });
        }
        builder
    }

    /// Ask the upstream about one indicator
    pub async fn lookup(&self, itype: IndicatorType, key: LookupKey) -> LookupResult {
        let _permit = self
            .outstanding
            .try_acquire()
            .map_err(|_| SourceError::Dropped)?;

        let value = match &key.content_type {
            Some(ctype) => format!("{};{}", key.value, ctype),
            None => key.value,
        };
        let body = encode_batch(&[Indicator::new(itype, value)]);

        let resp = self
            .client
            .post(format!("{}/get", self.base_url))
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(SourceError::Backend(format!(
                "upstream answered {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(transport_error)?;

        let (version, records) =
            decode_response(&bytes).map_err(|e| SourceError::Backend(e.to_string()))?;
        let current = self.upstream.read().version == Some(version);
        if !current {
            self.refresh_fields(version).await?;
        }

        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::Backend("upstream sent no record".into()))?;
        self.remap(&record).map(Some)
    }

    async fn refresh_fields(&self, seen: u32) -> Result<(), SourceError> {
        let _guard = self.refresh.lock().await;
        let current = self.upstream.read().version == Some(seen);
        if current {
            return Ok(());
        }

        let resp = self
            .client
            .get(format!("{}/fields?ver=1", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(SourceError::Backend(format!(
                "upstream fields answered {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(transport_error)?;
        let (version, descriptors) =
            decode_fields(&bytes).map_err(|e| SourceError::Backend(e.to_string()))?;

        let local_ids = descriptors
            .iter()
            .map(|d| match self.fields.register(d) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("{} skipping upstream field {:?}: {}", self.name, d, e);
                    None
                }
            })
            .collect();

        info!(
            "{} loaded {} upstream fields, version {}",
            self.name,
            descriptors.len(),
            version
        );
        *self.upstream.write() = UpstreamFields {
            version: Some(version),
            local_ids,
        };
        Ok(())
    }

    fn remap(&self, record: &MergedRecord) -> Result<PartialRecord, SourceError> {
        let pairs = record
            .decode()
            .map_err(|e| SourceError::Backend(e.to_string()))?;

        let upstream = self.upstream.read();
        let local: Vec<(u8, String)> = pairs
            .into_iter()
            .filter_map(|(id, value)| match upstream.local_ids.get(id as usize) {
                Some(Some(local)) => Some((*local, value)),
                _ => {
                    debug!("{} unmapped upstream field {}", self.name, id);
                    None
                }
            })
            .collect();

        PartialRecord::encode(&local, &self.limits).map_err(|e| SourceError::Backend(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wise_core::Source;

    fn config(url: Option<&str>, types: Vec<IndicatorType>) -> SourceConfig {
        SourceConfig {
            url: url.map(str::to_string),
            types,
            max_outstanding: 1,
            ..SourceConfig::default()
        }
    }

    fn proxy(fields: Arc<FieldRegistry>) -> ProxySource {
        ProxySource::new(
            "proxy:up",
            &config(Some("http://127.0.0.1:1/"), vec![IndicatorType::Ip, IndicatorType::Md5]),
            fields,
            ValueLimits::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let fields = Arc::new(FieldRegistry::new());
        assert!(matches!(
            ProxySource::new("proxy:a", &config(None, vec![IndicatorType::Ip]), fields.clone(), ValueLimits::default()),
            Err(GatewayError::Source(..))
        ));
        assert!(matches!(
            ProxySource::new("proxy:a", &config(Some("http://x"), vec![]), fields, ValueLimits::default()),
            Err(GatewayError::Source(..))
        ));
    }

    #[test]
    fn test_attach_installs_configured_types() {
        let p = Arc::new(proxy(Arc::new(FieldRegistry::new())));
        assert_eq!(p.base_url, "http://127.0.0.1:1");
        let source = p.attach(Source::builder("proxy:up")).build();
        assert_eq!(source.types(), vec![IndicatorType::Ip, IndicatorType::Md5]);
    }

    #[test]
    fn test_remap_to_local_ids() {
        let fields = Arc::new(FieldRegistry::new());
        fields.register("field:tags").unwrap();
        let p = proxy(fields.clone());

        let a = fields.register("field:a").unwrap();
        *p.upstream.write() = UpstreamFields {
            version: Some(1),
            local_ids: vec![Some(0), None, Some(a)],
        };

        let upstream = PartialRecord::encode(
            &[(2u8, "alpha"), (1, "dropped"), (0, "t"), (9, "unknown")],
            &ValueLimits::default(),
        )
        .unwrap();
        let merged = MergedRecord::merge([Some(&upstream)]).unwrap();

        let local = p.remap(&merged).unwrap();
        assert_eq!(
            local.decode().unwrap(),
            vec![(a, "alpha".to_string()), (0, "t".to_string())]
        );
    }

    #[tokio::test]
    async fn test_outstanding_cap_drops() {
        let p = proxy(Arc::new(FieldRegistry::new()));
        let _held = p.outstanding.try_acquire().unwrap();
        assert_eq!(
            p.lookup(IndicatorType::Ip, LookupKey::new("1.2.3.4")).await,
            Err(SourceError::Dropped)
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_an_error() {
        let p = proxy(Arc::new(FieldRegistry::new()));
        let result = p.lookup(IndicatorType::Ip, LookupKey::new("1.2.3.4")).await;
        assert!(matches!(
            result,
            Err(SourceError::Backend(_)) | Err(SourceError::Timeout)
        ));
    }
}
