//! Microsecond time sources.
//!
//! The throttle never reads the system time directly; it asks a [`Clock`].
//! Production shards use [`SystemClock`]; tests drive a [`ManualClock`] so
//! refill boundaries can be hit exactly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of absolute time in microseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_micros(&self) -> i64;
}

/// Microseconds since the Unix epoch, read once at construction and then
/// advanced by a monotonic `Instant`. Wall-clock steps after construction
/// never move it backwards.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
    origin_us: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            origin: Instant::now(),
            origin_us: i64::try_from(since_epoch.as_micros()).unwrap_or(i64::MAX),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_micros()).unwrap_or(i64::MAX);
        self.origin_us.saturating_add(elapsed)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    /// Moves time forward by `delta_us` and returns the new time. Negative
    /// deltas are treated as zero.
    pub fn advance(&self, delta_us: i64) -> i64 {
        let delta_us = delta_us.max(0);
        self.now_us.fetch_add(delta_us, Ordering::SeqCst) + delta_us
    }

    /// Jumps to `now_us`. Going backwards is ignored.
    pub fn set(&self, now_us: i64) {
        self.now_us.fetch_max(now_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Converts a non-negative microsecond span to a `Duration`; negative spans are zero.
pub(crate) fn micros_to_duration(us: i64) -> Duration {
    Duration::from_micros(u64::try_from(us).unwrap_or(0))
}
