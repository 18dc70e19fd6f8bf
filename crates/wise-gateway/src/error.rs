//! Gateway errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use wise_core::{CacheError, CodecError, EngineError, FilterError, RegistryError};

/// Gateway errors, startup and per-route
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Config file unreadable or invalid
    #[error("config error: {0}")]
    Config(String),

    /// I/O failure, e.g. binding the listener
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote cache tier could not be set up
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// A source section could not be turned into a source
    #[error("source {0}: {1}")]
    Source(String, String),

    /// Route named a type that does not exist
    #[error("Unknown type {0}")]
    UnknownType(String),

    /// Route named a source that does not exist
    #[error("Unknown source {0}")]
    UnknownSource(String),

    /// Resource exists but cannot be served in the requested form
    #[error("{0}")]
    NotFound(String),

    /// Engine refused or timed out
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A stored record failed to decode
    #[error("record error: {0}")]
    Codec(#[from] CodecError),
}

impl From<FilterError> for GatewayError {
    fn from(e: FilterError) -> Self {
        GatewayError::Config(e.to_string())
    }
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        GatewayError::Config(e.to_string())
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::UnknownType(_)
            | GatewayError::UnknownSource(_)
            | GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Engine(EngineError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Engine(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
