//! Request middleware

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Log every request with its status and latency
pub async fn logging(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    tracing::debug!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_us = start.elapsed().as_micros() as u64,
        "request complete"
    );

    response
}
