//! WISE Gateway
//!
//! HTTP front end for the lookup engine:
//! - `/get` binary batch lookups, plain and digest response layouts
//! - `/fields` field table exports
//! - operator routes for stats, sources, types, views and dumps
//! - single-indicator JSON lookups
//!
//! Sources are built from the `sources` config section. The only built-in
//! kind is `proxy`, which chains to another broker over `/get`.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod protocol;
pub mod proxy;

use axum::{routing::get, routing::post, Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wise_common::IndicatorType;
use wise_core::cache::RedisStore;
use wise_core::{
    FieldRegistry, LookupCache, MemoryCache, QueryEngine, Registry, Source, TwoTierCache,
    ValueLimits,
};

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};

use config::{source_kind, CacheKind, SourceConfig};
use proxy::ProxySource;

/// Application state shared across handlers
pub struct AppState {
    /// Lookup engine, which also owns the registry
    pub engine: Arc<QueryEngine>,
    /// Deadline for one request's lookups
    pub request_timeout: Duration,
}

impl AppState {
    /// Wrap an engine
    pub fn new(engine: Arc<QueryEngine>, request_timeout: Duration) -> Self {
        Self {
            engine,
            request_timeout,
        }
    }

    /// Build registry, sources, cache and engine from config.
    ///
    /// A source section that cannot be built is logged and skipped. Bad
    /// global excludes and an unreachable remote cache are fatal.
    pub async fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let limits = config.record.limits();
        let mut registry = Registry::new();

        for itype in IndicatorType::ALL {
            registry.set_global_deny(itype, config.service.exclude.get(itype))?;
        }
        for (name, view) in &config.views {
            registry.add_view(name.clone(), view.clone());
        }
        for (name, action) in &config.right_clicks {
            registry.add_right_click(name.clone(), action.clone());
        }

        for (name, section) in &config.sources {
            let source = match build_source(name, section, registry.fields(), limits) {
                Ok(source) => source,
                Err(e) => {
                    warn!("Skipping source {}: {}", name, e);
                    continue;
                }
            };
            if let Err(e) = registry.register_source(source) {
                warn!("Skipping source {}: {}", name, e);
            }
        }

        let cache: Arc<dyn LookupCache> = match config.cache.kind {
            CacheKind::Memory => Arc::new(MemoryCache::new(config.cache.cache_size)),
            CacheKind::Redis => {
                let url = config
                    .cache
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| GatewayError::Config("cache.redis_url is required".into()))?;
                let store = RedisStore::connect(url).await?;
                info!("Using redis cache at {}", url);
                Arc::new(TwoTierCache::new(
                    Arc::new(store),
                    config.cache.cache_size,
                    config.cache.redis_expire_secs,
                ))
            }
        };

        let engine = Arc::new(QueryEngine::new(Arc::new(registry), cache));
        Ok(Self::new(
            engine,
            Duration::from_millis(config.service.request_timeout_ms),
        ))
    }
}

/// Turn one `sources` section into a source
pub fn build_source(
    name: &str,
    section: &SourceConfig,
    fields: &Arc<FieldRegistry>,
    limits: ValueLimits,
) -> GatewayResult<Source> {
    let mut builder = Source::builder(name).ttl(section.ttl());
    for itype in IndicatorType::ALL {
        builder = builder
            .deny(itype, section.exclude.get(itype))?
            .allow(itype, section.only.get(itype))?;
    }
    if let Some(view) = section.combined_view() {
        builder = builder.view(view);
    }

    let builder = match source_kind(name) {
        "proxy" => {
            Arc::new(ProxySource::new(name, section, fields.clone(), limits)?).attach(builder)
        }
        kind => {
            return Err(GatewayError::Source(
                name.to_string(),
                format!("unsupported source kind {kind:?}"),
            ))
        }
    };

    for descriptor in section.field_descriptors() {
        fields.register(descriptor)?;
    }
    Ok(builder.build())
}

/// Build the router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Wire protocol
        .route("/get", post(handlers::get_batch))
        .route("/fields", get(handlers::fields))

        // Pass-through config
        .route("/views", get(handlers::views))
        .route("/rightClicks", get(handlers::right_clicks))
        .route("/valueActions", get(handlers::right_clicks))

        // Operator
        .route("/stats", get(handlers::stats))
        .route("/sources", get(handlers::sources))
        .route("/types", get(handlers::types))
        .route("/types/:source", get(handlers::source_types))
        .route("/dump/:source", get(handlers::dump))
        .route("/health", get(handlers::health))
        .route("/_ns_/nstest.html", get(handlers::nstest))

        // Single lookups, segments are positional
        .route("/:first/:second", get(handlers::lookup))
        .route("/:first/:second/:third", get(handlers::lookup_source))

        .layer(axum::middleware::from_fn(middleware::logging))
        .layer(Extension(state))
}

/// Start the gateway server
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<(), std::io::Error> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("WISE gateway listening on {}", addr);
    axum::serve(listener, app).await
}
