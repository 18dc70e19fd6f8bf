//! Error types shared across the broker

use thiserror::Error;

/// Broker-wide error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WiseError {
    /// Wire code outside the indicator table
    #[error("unknown indicator type code: {0}")]
    UnknownTypeCode(u8),

    /// Indicator name outside the indicator table
    #[error("unknown indicator type: {0}")]
    UnknownTypeName(String),
}

/// Result type for shared operations
pub type WiseResult<T> = Result<T, WiseError>;
