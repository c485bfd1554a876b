//! Rate controller: turns engine backlog and write amplification into a new
//! admission rate.
//!
//! # Tuning Cycle
//! 1. Observed throughput since the last tuning point
//! 2. Fresh telemetry: backlog, thresholds, cumulative background I/O
//! 3. Two backpressure estimates, each scaling the observed rate by
//!    "ideal backlog / current backlog":
//!    - memory: `(min_merge + 2*max_buffers) / (buffers + 2*max_buffers)`
//!    - level 0: `(l0_trigger + 2*l0_slowdown + 4) / (l0_files + 2*l0_slowdown)`
//! 4. Blend by each source's share of background I/O in the interval
//! 5. Clamp to `max_rate`, which scales the reference disk rate down by
//!    cumulative write amplification. There is no lower clamp on the target:
//!    heavy backlog may push it below `min_rate`, and the bucket's per-period
//!    floor keeps writers moving
//! 6. Commit into the bucket and move both baselines

use crate::bucket::TokenBucket;
use crate::config::ThrottleConfig;
use crate::telemetry::{Backlog, BacklogThresholds, EngineTelemetry, IoCounters};
use parking_lot::Mutex;

const MICROS_PER_SEC: i128 = 1_000_000;

/// Inputs sampled for one tuning cycle. Only the cumulative I/O counters
/// outlive the cycle, as the next baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSnapshot {
    pub observed_rate: i64,
    pub backlog: Backlog,
    pub thresholds: BacklogThresholds,
    /// Cumulative counters, or the fallback pair when statistics are off
    pub io: IoCounters,
    /// Background I/O since the previous cycle
    pub io_delta: IoCounters,
    pub statistics_available: bool,
}

/// Everything one committed cycle decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneDecision {
    pub snapshot: ControllerSnapshot,
    pub mem_ratio: i64,
    pub l0_ratio: i64,
    pub flush_weight: f64,
    pub compaction_weight: f64,
    pub max_rate: i64,
    pub new_rate: i64,
    pub refill_bytes_per_period: i64,
}

/// Bytes per second over `elapsed_us`, or `None` when no time has passed.
pub fn observed_rate(interval_bytes: i64, elapsed_us: i64) -> Option<i64> {
    if elapsed_us <= 0 {
        return None;
    }
    let rate = i128::from(interval_bytes.max(0)) * MICROS_PER_SEC / i128::from(elapsed_us);
    Some(i64::try_from(rate).unwrap_or(i64::MAX))
}

/// `observed * numerator / denominator`; a zero denominator leaves `observed` unchanged.
fn scale_rate(observed: i64, numerator: u64, denominator: u64) -> i64 {
    if denominator == 0 {
        return observed;
    }
    let scaled = i128::from(observed) * i128::from(numerator) / i128::from(denominator);
    i64::try_from(scaled).unwrap_or(if scaled < 0 { i64::MIN } else { i64::MAX })
}

/// Rate estimate from write-buffer (memtable) pressure.
pub fn memory_pressure_rate(observed: i64, backlog: &Backlog, t: &BacklogThresholds) -> i64 {
    let double_max = t.max_write_buffer_number.saturating_mul(2);
    scale_rate(
        observed,
        t.min_write_buffer_number_to_merge.saturating_add(double_max),
        backlog.write_buffers.saturating_add(double_max),
    )
}

/// Rate estimate from level-0 file pressure.
pub fn level0_pressure_rate(observed: i64, backlog: &Backlog, t: &BacklogThresholds) -> i64 {
    let double_slowdown = t.level0_slowdown_writes_trigger.saturating_mul(2);
    scale_rate(
        observed,
        t.level0_file_num_compaction_trigger
            .saturating_add(double_slowdown)
            .saturating_add(4),
        backlog.l0_files.saturating_add(double_slowdown),
    )
}

/// `(k1, k2)`: flush and compaction shares of the interval's background I/O.
/// An idle interval weighs both sources equally.
pub fn blend_weights(delta: &IoCounters) -> (f64, f64) {
    let flush = delta.flush_bytes as f64;
    let compaction = delta.compaction_bytes as f64;
    if flush + compaction == 0.0 {
        return (0.5, 0.5);
    }
    let k1 = flush / (flush + compaction);
    (k1, 1.0 - k1)
}

/// Ceiling for the admission rate.
///
/// `reference * total_bytes_through / background_bytes`, floored at
/// `min_rate`. Falls back to `reference` when there is no background I/O
/// yet or the product would overflow.
pub fn calculate_max_rate(
    reference_rate: i64,
    min_rate: i64,
    total_bytes_through: i64,
    background_bytes: u64,
) -> i64 {
    let total = total_bytes_through.max(0);
    if background_bytes == 0 || reference_rate <= 0 || total > i64::MAX / reference_rate {
        return reference_rate;
    }
    let scaled = i128::from(reference_rate * total) / i128::from(background_bytes);
    i64::try_from(scaled).unwrap_or(i64::MAX).max(min_rate)
}

/// Per-shard controller. Owns only the background I/O baseline.
#[derive(Debug)]
pub struct RateController {
    reference_rate: i64,
    min_rate: i64,
    fallback_io: IoCounters,
    /// Cumulative background I/O at the previous cycle; the lock also
    /// serializes whole tuning cycles.
    baseline: Mutex<IoCounters>,
}

impl RateController {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            reference_rate: config.reference_disk_rate_bytes_per_sec,
            min_rate: config.min_rate_bytes_per_sec,
            fallback_io: IoCounters {
                flush_bytes: config.fallback_io.flush_bytes,
                compaction_bytes: config.fallback_io.compaction_bytes,
            },
            baseline: Mutex::new(IoCounters::default()),
        }
    }

    /// Samples the starting baseline. Without statistics the baseline stays as is.
    pub fn reset_baseline(&self, telemetry: &dyn EngineTelemetry) {
        if let Some(io) = telemetry.io_counters() {
            *self.baseline.lock() = io;
        }
    }

    pub fn baseline(&self) -> IoCounters {
        *self.baseline.lock()
    }

    /// Runs one tuning cycle against `bucket` and commits the result.
    ///
    /// Returns `None` when the cycle was skipped because no time elapsed
    /// since the previous tuning point; nothing is modified in that case.
    pub fn tune(
        &self,
        bucket: &TokenBucket,
        telemetry: &dyn EngineTelemetry,
        now_us: i64,
    ) -> Option<TuneDecision> {
        let mut baseline = self.baseline.lock();

        let total_bytes_through = bucket.total_bytes_through();
        let interval_bytes = total_bytes_through - bucket.last_bytes_through();
        let Some(observed) = observed_rate(interval_bytes, now_us - bucket.tune_time_us()) else {
            tracing::debug!(now_us, "tuning skipped: no time elapsed since last cycle");
            return None;
        };

        let backlog = telemetry.backlog();
        let thresholds = telemetry.thresholds();
        let (io, io_delta, statistics_available) = match telemetry.io_counters() {
            Some(io) => (io, io.since(&baseline), true),
            None => {
                tracing::debug!("engine statistics unavailable, using fallback I/O pair");
                (self.fallback_io, self.fallback_io, false)
            }
        };
        *baseline = io;

        let max_rate = calculate_max_rate(
            self.reference_rate,
            self.min_rate,
            total_bytes_through,
            io.total(),
        );
        let mem_ratio = memory_pressure_rate(observed, &backlog, &thresholds);
        let l0_ratio = level0_pressure_rate(observed, &backlog, &thresholds);
        let (k1, k2) = blend_weights(&io_delta);

        // f64 -> i64 casts saturate
        let blended = (k1 * mem_ratio as f64 + k2 * l0_ratio as f64) as i64;
        let new_rate = blended.min(max_rate);

        bucket.set_max_rate(max_rate);
        let refill_bytes_per_period = bucket.install_rate(new_rate);
        bucket.mark_tuned(now_us, total_bytes_through);

        tracing::info!(
            observed_rate = observed,
            new_rate,
            max_rate,
            k1,
            k2,
            write_buffers = backlog.write_buffers,
            l0_files = backlog.l0_files,
            "admission rate tuned"
        );

        Some(TuneDecision {
            snapshot: ControllerSnapshot {
                observed_rate: observed,
                backlog,
                thresholds,
                io,
                io_delta,
                statistics_available,
            },
            mem_ratio,
            l0_ratio,
            flush_weight: k1,
            compaction_weight: k2,
            max_rate,
            new_rate,
            refill_bytes_per_period,
        })
    }
}
