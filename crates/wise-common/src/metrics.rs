//! Lock-free counters for per-source and per-type bookkeeping

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Exponentially weighted moving average of fetch latency, in milliseconds.
///
/// Each sample moves the average 1% of the way toward it. The value is kept
/// as `f64` bits in an `AtomicU64` and updated with a CAS loop.
#[derive(Debug, Default)]
pub struct LatencyEwma(AtomicU64);

impl LatencyEwma {
    const KEEP: f64 = 0.99;
    const TAKE: f64 = 0.01;

    /// Create a zeroed average
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Fold one sample in
    pub fn record(&self, sample_ms: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) * Self::KEEP + sample_ms * Self::TAKE;
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current average
    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}
