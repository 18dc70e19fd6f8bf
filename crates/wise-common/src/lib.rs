//! WISE Common - Shared vocabulary for the lookup broker
//!
//! This crate provides the small, dependency-light primitives every other
//! crate in the workspace agrees on:
//! - The closed set of indicator types and their wire codes
//! - Clocks (wall-clock seconds, plus a manual clock for tests)
//! - Lock-free counters and the latency moving average
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metrics;

pub use error::*;
pub use metrics::{AtomicCounter, LatencyEwma};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Indicator kinds a client can look up.
///
/// The discriminant is the byte used on the wire. The mapping is fixed and
/// shared with capture clients, so new variants may only be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IndicatorType {
    /// IPv4 or IPv6 address
    Ip = 0,
    /// DNS name
    Domain = 1,
    /// MD5 file hash, optionally qualified with `;content-type`
    Md5 = 2,
    /// Email address
    Email = 3,
    /// URL
    Url = 4,
    /// Flow tuple
    Tuple = 5,
    /// JA3 TLS fingerprint
    Ja3 = 6,
    /// SHA-256 file hash, optionally qualified with `;content-type`
    Sha256 = 7,
}

impl IndicatorType {
    /// Every type, in wire-code order
    pub const ALL: [IndicatorType; 8] = [
        IndicatorType::Ip,
        IndicatorType::Domain,
        IndicatorType::Md5,
        IndicatorType::Email,
        IndicatorType::Url,
        IndicatorType::Tuple,
        IndicatorType::Ja3,
        IndicatorType::Sha256,
    ];

    /// Number of indicator types
    pub const COUNT: usize = Self::ALL.len();

    /// Decode a wire code, rejecting anything outside the table
    pub fn from_code(code: u8) -> WiseResult<Self> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(WiseError::UnknownTypeCode(code))
    }

    /// Wire code
    #[inline(always)]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Position of this type in per-type tables
    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical lowercase name
    pub fn name(self) -> &'static str {
        match self {
            IndicatorType::Ip => "ip",
            IndicatorType::Domain => "domain",
            IndicatorType::Md5 => "md5",
            IndicatorType::Email => "email",
            IndicatorType::Url => "url",
            IndicatorType::Tuple => "tuple",
            IndicatorType::Ja3 => "ja3",
            IndicatorType::Sha256 => "sha256",
        }
    }

    /// Hash types carry an optional `;content-type` suffix
    pub fn is_hash(self) -> bool {
        matches!(self, IndicatorType::Md5 | IndicatorType::Sha256)
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IndicatorType {
    type Err = WiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| WiseError::UnknownTypeName(s.to_string()))
    }
}

/// Source of "now" in whole seconds since the epoch.
///
/// Cache freshness is computed against this so tests can move time by hand.
pub trait Clock: Send + Sync {
    /// Current time in seconds
    fn now_secs(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_secs(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Create clock starting at `secs`
    pub fn new(secs: u64) -> Self {
        Self(AtomicU64::new(secs))
    }

    /// Move forward by `secs`
    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
