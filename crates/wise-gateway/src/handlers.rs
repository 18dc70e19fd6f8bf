//! Route handlers

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use wise_common::IndicatorType;
use wise_core::record::RenderedPair;
use wise_core::{Indicator, MergedRecord};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{encode_response, encode_response_v2, parse_batch, RESPONSE_V2};
use crate::AppState;

const OCTET_STREAM: &str = "application/octet-stream";
const DUMP_BUFFER: usize = 64 * 1024;

/// `/get` query
#[derive(Debug, Default, Deserialize)]
pub struct GetParams {
    pub ver: Option<u32>,
    /// Comma-separated field table digests the client already holds
    pub hashes: Option<String>,
}

/// Binary batch lookup
pub async fn get_batch(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<GetParams>,
    body: Bytes,
) -> GatewayResult<impl IntoResponse> {
    let items = parse_batch(&body);
    debug!("Batch of {} indicators", items.len());
    let records = state
        .engine
        .lookup_batch(items, state.request_timeout)
        .await?;

    let fields = state.engine.registry().fields();
    let body = if params.ver == Some(RESPONSE_V2) {
        let hashes: Vec<&str> = params
            .hashes
            .as_deref()
            .map(|h| h.split(',').collect())
            .unwrap_or_default();
        encode_response_v2(fields, &hashes, &records)
    } else {
        encode_response(fields.version(), &records)
    };
    Ok(([(header::CONTENT_TYPE, OCTET_STREAM)], body))
}

/// `/fields` query
#[derive(Debug, Default, Deserialize)]
pub struct FieldsParams {
    pub ver: Option<u32>,
}

/// Field table export
pub async fn fields(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<FieldsParams>,
) -> GatewayResult<impl IntoResponse> {
    let fields = state.engine.registry().fields();
    let body = match params.ver.unwrap_or(0) {
        0 => fields.export_v0().ok_or_else(|| {
            GatewayError::NotFound("Too many fields for ver=0, use ver=1".into())
        })?,
        1 => fields.export_v1(),
        other => return Err(GatewayError::NotFound(format!("Unknown fields ver {other}"))),
    };
    Ok(([(header::CONTENT_TYPE, OCTET_STREAM)], body))
}

/// View blobs
pub async fn views(Extension(state): Extension<Arc<AppState>>) -> Json<BTreeMap<String, Value>> {
    Json(state.engine.registry().views().clone())
}

/// Value-action blobs, served as both `/rightClicks` and `/valueActions`
pub async fn right_clicks(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<BTreeMap<String, Value>> {
    Json(state.engine.registry().right_clicks().clone())
}

/// `/stats` query
#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    pub search: Option<String>,
}

/// Counters, optionally narrowed to types and sources whose name contains
/// `search`
pub async fn stats(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Json<wise_core::EngineStats> {
    let mut stats = state.engine.stats();
    if let Some(search) = params.search.filter(|s| !s.is_empty()) {
        stats.types.retain(|t| t.name.name().contains(&search));
        stats.sources.retain(|s| s.source.contains(&search));
    }
    Json(stats)
}

/// Source names
pub async fn sources(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.engine.registry().source_names())
}

/// Types with at least one source
pub async fn types(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<IndicatorType>> {
    Json(state.engine.registry().types())
}

/// Types one source answers
pub async fn source_types(
    Extension(state): Extension<Arc<AppState>>,
    Path(source): Path<String>,
) -> GatewayResult<Json<Vec<IndicatorType>>> {
    let src = state
        .engine
        .registry()
        .source(&source)
        .ok_or(GatewayError::UnknownSource(source))?;
    Ok(Json(src.types()))
}

/// Everything a source holds, through its own dump if it has one, otherwise
/// its results in the local cache tier. The body streams as it is written.
pub async fn dump(
    Extension(state): Extension<Arc<AppState>>,
    Path(source): Path<String>,
) -> GatewayResult<impl IntoResponse> {
    let src = state
        .engine
        .registry()
        .source(&source)
        .cloned()
        .ok_or_else(|| GatewayError::UnknownSource(source.clone()))?;

    let (mut writer, reader) = tokio::io::duplex(DUMP_BUFFER);
    match src.dumper().cloned() {
        Some(dumper) => {
            tokio::spawn(async move {
                if let Err(e) = dumper.dump(&mut writer).await {
                    debug!("Dump of {} ended early: {}", source, e);
                }
            });
        }
        None => {
            let cached = state.engine.cached_results(&source)?;
            let fields = state.engine.registry().fields().clone();
            tokio::spawn(async move {
                for (itype, value, ts, record) in cached {
                    let pairs = match record.decode() {
                        Ok(pairs) => pairs,
                        Err(e) => {
                            warn!("Dump of {} skipped {} {}: {}", source, itype, value, e);
                            continue;
                        }
                    };
                    let pairs: Vec<String> = pairs
                        .into_iter()
                        .map(|(id, v)| {
                            let name = fields.name_of(id).unwrap_or_else(|| format!("#{id}"));
                            format!("{name}={v}")
                        })
                        .collect();
                    let line = format!("{itype}\t{value}\t{ts}\t{}\n", pairs.join(";"));
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        debug!("Dump of {} ended early: {}", source, e);
                        return;
                    }
                }
            });
        }
    }

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(ReaderStream::new(reader)),
    ))
}

fn parse_type(name: &str) -> GatewayResult<IndicatorType> {
    name.parse()
        .map_err(|_| GatewayError::UnknownType(name.to_string()))
}

fn render(state: &AppState, record: &MergedRecord) -> GatewayResult<Vec<RenderedPair>> {
    let fields = state.engine.registry().fields();
    Ok(record.render(|id| fields.name_of(id))?)
}

/// One indicator across every source, as JSON
pub async fn lookup(
    Extension(state): Extension<Arc<AppState>>,
    Path((itype, value)): Path<(String, String)>,
) -> GatewayResult<Json<Vec<RenderedPair>>> {
    let itype = parse_type(&itype)?;
    let records = state
        .engine
        .lookup_batch(vec![Some(Indicator::new(itype, value))], state.request_timeout)
        .await?;
    let record = records.into_iter().next().unwrap_or_default();
    Ok(Json(render(&state, &record)?))
}

/// One indicator in one source, as JSON
pub async fn lookup_source(
    Extension(state): Extension<Arc<AppState>>,
    Path((source, itype, value)): Path<(String, String, String)>,
) -> GatewayResult<Json<Vec<RenderedPair>>> {
    let itype = parse_type(&itype)?;
    if state.engine.registry().source(&source).is_none() {
        return Err(GatewayError::UnknownSource(source));
    }
    let record = state
        .engine
        .lookup_in_within(&source, itype, &value, state.request_timeout)
        .await?;
    Ok(Json(render(&state, &record)?))
}

/// Liveness probe
pub async fn nstest() -> StatusCode {
    StatusCode::OK
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sources: usize,
    pub fields: usize,
}

/// Health check
pub async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.engine.registry();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sources: registry.sources().len(),
        fields: registry.fields().len(),
    })
}
