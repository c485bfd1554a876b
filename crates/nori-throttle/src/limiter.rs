//! Per-shard write throttle: token bucket plus piggybacked rate tuning.
//!
//! # Request Path
//! 1. Stopped? Return immediately, nothing accounted
//! 2. First request on the shard: start the bucket, reset throughput
//!    counters, sample the background I/O baseline (exactly once)
//! 3. Count the request; every `tune_requests`-th one runs a tuning cycle
//!    on the caller's thread
//! 4. Block in the bucket until the bytes are debited
//!
//! There is no background thread. Tuning latency lands on one writer per
//! cycle.

use crate::bucket::{Admission, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::config::ThrottleConfig;
use crate::controller::{RateController, TuneDecision};
use crate::error::Result;
use crate::telemetry::EngineTelemetry;
use nori_observe::{obs_count, obs_gauge, obs_hist, obs_timed};
use nori_observe::{Meter, NoopMeter, ThrottleEvt, ThrottleKind, VizEvent};
use parking_lot::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time view of a throttle's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    pub available_bytes: i64,
    pub rate_bytes_per_sec: i64,
    pub max_rate_bytes_per_sec: i64,
    pub refill_period_us: i64,
    pub refill_bytes_per_period: i64,
    pub next_refill_us: i64,
    pub total_requests: u64,
    pub total_bytes_through: i64,
    pub last_bytes_through: i64,
    pub refills_applied: u64,
    pub tune_cycles: u64,
    pub stopped: bool,
}

/// Adaptive admission throttle for one shard's write path.
///
/// Shared by reference (usually `Arc`) across all writer threads of the
/// shard; never shared across shards.
pub struct WriteThrottle {
    shard: u32,
    config: ThrottleConfig,
    bucket: TokenBucket,
    controller: RateController,
    telemetry: Arc<dyn EngineTelemetry>,
    clock: Arc<dyn Clock>,
    meter: Arc<dyn Meter>,
    started: Once,
    first_request: Once,
    tune_cycles: AtomicU64,
}

impl WriteThrottle {
    /// Creates a throttle on the system clock with no telemetry export.
    ///
    /// Nothing is scheduled until `start()` or the first `request()`.
    pub fn new(config: ThrottleConfig, telemetry: Arc<dyn EngineTelemetry>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shard: 0,
            bucket: TokenBucket::new(config.refill_period_us, config.initial_rate_bytes_per_sec, 0),
            controller: RateController::new(&config),
            config,
            telemetry,
            clock: Arc::new(SystemClock::new()),
            meter: Arc::new(NoopMeter),
            started: Once::new(),
            first_request: Once::new(),
            tune_cycles: AtomicU64::new(0),
        })
    }

    /// Labels emitted events with `shard`.
    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = shard;
        self
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Sets the tuning clock, first refill deadline and initial rate. Idempotent.
    pub fn start(&self) {
        self.started.call_once(|| {
            let now = self.clock.now_micros();
            self.bucket.start(now, self.config.initial_rate_bytes_per_sec);
            tracing::debug!(
                shard = self.shard,
                rate_bytes_per_sec = self.config.initial_rate_bytes_per_sec,
                refill_bytes_per_period = self.bucket.refill_bytes_per_period(),
                refill_period_us = self.config.refill_period_us,
                "write throttle started"
            );
        });
    }

    /// Admits `bytes` into the write path, blocking until the bucket covers them.
    ///
    /// Returns immediately once the throttle is stopped. Zero-byte requests
    /// are counted but never wait.
    pub fn request(&self, bytes: u64) {
        if self.bucket.is_stopped() {
            return;
        }

        self.first_request.call_once(|| self.initialize());

        let n = self.bucket.count_request();
        if n % self.config.tune_requests == 0 {
            self.tune_cycle();
        }

        if let Admission::AfterWait { waited_us } = self.bucket.acquire(bytes, self.clock.as_ref())
        {
            obs_count!(self.meter, "throttle_stalls_total", &[], 1);
            obs_hist!(self.meter, "throttle_wait_ms", &[], waited_us as f64 / 1000.0);
            self.emit(ThrottleKind::Stalled { bytes, waited_us });
        }
    }

    /// Runs a tuning cycle now, outside the every-Nth-request cadence.
    pub fn tune_now(&self) -> Option<TuneDecision> {
        if self.bucket.is_stopped() {
            return None;
        }
        self.first_request.call_once(|| self.initialize());
        self.tune_cycle()
    }

    /// Stops admission accounting for good and releases blocked writers.
    pub fn stop(&self) {
        if !self.bucket.stop() {
            return;
        }
        let total_bytes_through = self.bucket.total_bytes_through();
        tracing::info!(
            shard = self.shard,
            total_bytes_through,
            total_requests = self.bucket.total_requests(),
            "write throttle stopped"
        );
        self.emit(ThrottleKind::Stopped {
            total_bytes_through,
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.bucket.is_stopped()
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            available_bytes: self.bucket.available_bytes(),
            rate_bytes_per_sec: self.bucket.rate_bytes_per_sec(),
            max_rate_bytes_per_sec: self.bucket.max_rate_bytes_per_sec(),
            refill_period_us: self.bucket.refill_period_us(),
            refill_bytes_per_period: self.bucket.refill_bytes_per_period(),
            next_refill_us: self.bucket.next_refill_us(),
            total_requests: self.bucket.total_requests(),
            total_bytes_through: self.bucket.total_bytes_through(),
            last_bytes_through: self.bucket.last_bytes_through(),
            refills_applied: self.bucket.refills_applied(),
            tune_cycles: self.tune_cycles.load(Ordering::Acquire),
            stopped: self.bucket.is_stopped(),
        }
    }

    fn initialize(&self) {
        self.start();
        self.bucket.reset_throughput(self.clock.now_micros());
        self.controller.reset_baseline(self.telemetry.as_ref());
        tracing::debug!(
            shard = self.shard,
            baseline = ?self.controller.baseline(),
            "write throttle initialized on first request"
        );
        self.emit(ThrottleKind::Initialized {
            rate_bytes_per_sec: self.bucket.rate_bytes_per_sec(),
        });
    }

    fn tune_cycle(&self) -> Option<TuneDecision> {
        let decision = obs_timed!(self.meter, "throttle_tune_ms", &[], {
            self.controller
                .tune(&self.bucket, self.telemetry.as_ref(), self.clock.now_micros())
        })?;

        self.tune_cycles.fetch_add(1, Ordering::AcqRel);
        obs_gauge!(self.meter, "throttle_rate_bytes_per_sec", &[], decision.new_rate);
        obs_gauge!(self.meter, "throttle_max_rate_bytes_per_sec", &[], decision.max_rate);
        self.emit(ThrottleKind::RateTuned {
            observed_rate: decision.snapshot.observed_rate,
            new_rate: decision.new_rate,
            max_rate: decision.max_rate,
            flush_weight: decision.flush_weight,
            write_buffers: decision.snapshot.backlog.write_buffers,
            l0_files: decision.snapshot.backlog.l0_files,
        });

        Some(decision)
    }

    fn emit(&self, kind: ThrottleKind) {
        self.meter.emit(VizEvent::Throttle(ThrottleEvt {
            shard: self.shard,
            kind,
        }));
    }
}

impl Drop for WriteThrottle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WriteThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteThrottle")
            .field("shard", &self.shard)
            .field("stats", &self.stats())
            .finish()
    }
}
