//! Write Throttle Concurrency Tests
//!
//! Properties checked with many writer threads sharing one shard's throttle:
//! - Exactly one credit per refill period, however many writers race for it
//! - Exactly-once lazy initialization
//! - Byte conservation (credits - debits == balance)
//! - Bounded latency for requests within one period's credit
//! - Stop releases blocked writers without accounting

use nori_observe::{ThrottleEvt, ThrottleKind, VizEvent};
use nori_throttle::{
    Admission, AtomicTelemetry, Backlog, BacklogThresholds, ManualClock, ThrottleConfig,
    TokenBucket, WriteThrottle,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const MIB: i64 = 1024 * 1024;

// Test meter that captures VizEvents for analysis
struct CapturingMeter {
    events: Arc<parking_lot::Mutex<Vec<VizEvent>>>,
}

impl CapturingMeter {
    fn new() -> Self {
        Self {
            events: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    fn kinds(&self) -> Vec<ThrottleKind> {
        self.events
            .lock()
            .iter()
            .map(|evt| match evt {
                VizEvent::Throttle(ThrottleEvt { kind, .. }) => kind.clone(),
                _ => unreachable!("throttle only emits throttle events"),
            })
            .collect()
    }
}

struct TestInstrument;
impl nori_observe::Counter for TestInstrument {
    fn inc(&self, _v: u64) {}
}
impl nori_observe::Gauge for TestInstrument {
    fn set(&self, _v: i64) {}
}
impl nori_observe::Histogram for TestInstrument {
    fn observe(&self, _v: f64) {}
}

impl nori_observe::Meter for CapturingMeter {
    fn counter(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn nori_observe::Counter> {
        Box::new(TestInstrument)
    }

    fn gauge(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn nori_observe::Gauge> {
        Box::new(TestInstrument)
    }

    fn histo(
        &self,
        _name: &'static str,
        _buckets: &'static [f64],
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn nori_observe::Histogram> {
        Box::new(TestInstrument)
    }

    fn emit(&self, evt: VizEvent) {
        self.events.lock().push(evt);
    }
}

fn thresholds() -> BacklogThresholds {
    BacklogThresholds {
        max_write_buffer_number: 4,
        min_write_buffer_number_to_merge: 2,
        level0_slowdown_writes_trigger: 20,
        level0_file_num_compaction_trigger: 4,
    }
}

/// Throttle on a manual clock, started at t=0 (first refill due at one period).
fn manual_throttle(
    config: ThrottleConfig,
) -> (Arc<WriteThrottle>, Arc<ManualClock>, Arc<AtomicTelemetry>, Arc<CapturingMeter>) {
    let clock = Arc::new(ManualClock::new(0));
    let telemetry = Arc::new(AtomicTelemetry::new(thresholds()));
    let meter = Arc::new(CapturingMeter::new());
    let throttle = WriteThrottle::new(config, telemetry.clone())
        .unwrap()
        .with_shard(7)
        .with_clock(clock.clone())
        .with_meter(meter.clone());
    throttle.start();
    (Arc::new(throttle), clock, telemetry, meter)
}

// ============================================================================
// Refill serialization
// ============================================================================

#[test]
fn test_single_credit_when_writers_straddle_refill_boundary() {
    const WRITERS: usize = 16;

    // 1000 bytes/s over 1s periods: 1000 bytes per credit
    let clock = Arc::new(ManualClock::new(0));
    let bucket = Arc::new(TokenBucket::new(1_000_000, 1_000, 0));
    let barrier = Arc::new(Barrier::new(WRITERS));

    // Every writer arrives exactly on the deadline with an empty bucket
    clock.set(1_000_000);

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let bucket = bucket.clone();
            let clock = clock.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                bucket.acquire(50, clock.as_ref())
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Admission::Immediate);
    }

    assert_eq!(bucket.refills_applied(), 1);
    assert_eq!(bucket.total_bytes_through(), 50 * WRITERS as i64);
    assert_eq!(bucket.available_bytes(), 1_000 - 50 * WRITERS as i64);
    assert_eq!(bucket.next_refill_us(), 2_000_000);
}

#[test]
fn test_conservation_under_contention() {
    const WRITERS: usize = 8;
    const REQUESTS: usize = 50;
    const BYTES: u64 = 100;

    // 1ms periods, 1000 bytes per credit; no tuning during the run
    let config = ThrottleConfig {
        initial_rate_bytes_per_sec: 1_000_000,
        refill_period_us: 1_000,
        ..ThrottleConfig::default()
    };
    let throttle = Arc::new(
        WriteThrottle::new(config, Arc::new(AtomicTelemetry::default())).unwrap(),
    );
    throttle.start();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let throttle = throttle.clone();
            thread::spawn(move || {
                for _ in 0..REQUESTS {
                    throttle.request(BYTES);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = throttle.stats();
    let admitted = (WRITERS * REQUESTS) as i64 * BYTES as i64;
    assert_eq!(stats.total_requests, (WRITERS * REQUESTS) as u64);
    assert_eq!(stats.total_bytes_through, admitted);
    assert_eq!(
        stats.available_bytes,
        stats.refills_applied as i64 * stats.refill_bytes_per_period - admitted
    );
    assert!(stats.available_bytes >= 0);
    assert!(stats.refills_applied >= 40);
}

// ============================================================================
// Lazy initialization
// ============================================================================

#[test]
fn test_first_request_initializes_exactly_once() {
    const WRITERS: usize = 32;

    let clock = Arc::new(ManualClock::new(0));
    let telemetry = Arc::new(AtomicTelemetry::new(thresholds()));
    telemetry.record_flush(1_000);
    let meter = Arc::new(CapturingMeter::new());
    // Not started: the first request has to do it
    let throttle = Arc::new(
        WriteThrottle::new(ThrottleConfig::default(), telemetry)
            .unwrap()
            .with_clock(clock.clone())
            .with_meter(meter.clone()),
    );
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let throttle = throttle.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                throttle.request(0);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let inits = meter
        .kinds()
        .into_iter()
        .filter(|k| matches!(k, ThrottleKind::Initialized { .. }))
        .count();
    assert_eq!(inits, 1);

    let stats = throttle.stats();
    assert_eq!(stats.total_requests, WRITERS as u64);
    assert_eq!(stats.rate_bytes_per_sec, 400 * MIB);
    assert_eq!(stats.next_refill_us, 100_000);
}

// ============================================================================
// Latency
// ============================================================================

#[test]
fn test_zero_byte_request_never_blocks() {
    let (throttle, _clock, _, meter) = manual_throttle(ThrottleConfig::default());

    // Empty bucket, clock frozen before the first deadline
    for _ in 0..100 {
        throttle.request(0);
    }

    assert_eq!(throttle.stats().refills_applied, 0);
    assert!(!meter
        .kinds()
        .iter()
        .any(|k| matches!(k, ThrottleKind::Stalled { .. })));
}

#[test]
fn test_request_within_one_period_from_empty_bucket() {
    // 20ms periods, 10_000 bytes per credit
    let config = ThrottleConfig {
        initial_rate_bytes_per_sec: 500_000,
        refill_period_us: 20_000,
        ..ThrottleConfig::default()
    };
    let throttle = WriteThrottle::new(config, Arc::new(AtomicTelemetry::default())).unwrap();
    throttle.start();
    assert_eq!(throttle.stats().available_bytes, 0);

    let started = Instant::now();
    throttle.request(10_000);
    let elapsed = started.elapsed();

    // One period plus scheduling slack
    assert!(elapsed < Duration::from_millis(20 + 200), "took {:?}", elapsed);
    assert_eq!(throttle.stats().refills_applied, 1);
    assert_eq!(throttle.stats().available_bytes, 0);
}

#[test]
fn test_default_rate_admits_until_balance_runs_short() {
    // 400 MiB/s, 100ms: 41_943_040 bytes per credit
    let (throttle, clock, _, meter) = manual_throttle(ThrottleConfig::default());
    assert_eq!(throttle.stats().refill_bytes_per_period, 41_943_040);

    clock.set(100_000);
    for _ in 0..4 {
        throttle.request(10_000_000);
    }
    let stats = throttle.stats();
    assert_eq!(stats.refills_applied, 1);
    assert_eq!(stats.available_bytes, 1_943_040);

    // Fifth request exceeds the balance and waits for the next credit
    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let throttle = throttle.clone();
        let done = done.clone();
        thread::spawn(move || {
            throttle.request(10_000_000);
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "admitted before the refill was due");

    clock.set(200_000);
    writer.join().unwrap();

    let stats = throttle.stats();
    assert_eq!(stats.refills_applied, 2);
    assert_eq!(stats.total_bytes_through, 50_000_000);
    assert_eq!(stats.available_bytes, 2 * 41_943_040 - 50_000_000);
    assert!(meter
        .kinds()
        .iter()
        .any(|k| matches!(k, ThrottleKind::Stalled { bytes: 10_000_000, .. })));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_stop_releases_blocked_writers() {
    const WRITERS: usize = 4;
    let (throttle, _clock, _, meter) = manual_throttle(ThrottleConfig::default());

    // Clock frozen before the first deadline: every writer blocks
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let throttle = throttle.clone();
            thread::spawn(move || throttle.request(1_000))
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    throttle.stop();
    throttle.stop();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = throttle.stats();
    assert!(stats.stopped);
    assert_eq!(stats.total_bytes_through, 0);
    assert_eq!(stats.available_bytes, 0);
    assert_eq!(stats.refills_applied, 0);

    let stops = meter
        .kinds()
        .into_iter()
        .filter(|k| matches!(k, ThrottleKind::Stopped { .. }))
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn test_drop_stops_throttle() {
    let meter = Arc::new(CapturingMeter::new());
    {
        let throttle = WriteThrottle::new(ThrottleConfig::default(), Arc::new(AtomicTelemetry::default()))
            .unwrap()
            .with_meter(meter.clone());
        throttle.request(0);
    }
    assert!(meter
        .kinds()
        .iter()
        .any(|k| matches!(k, ThrottleKind::Stopped { total_bytes_through: 0 })));
}

// ============================================================================
// Tuning on the request path
// ============================================================================

#[test]
fn test_tuning_backs_off_under_l0_pressure() {
    let config = ThrottleConfig {
        tune_requests: 10,
        ..ThrottleConfig::default()
    };
    let (throttle, clock, telemetry, meter) = manual_throttle(config);
    clock.set(100_000);

    // L0 well past the slowdown trigger, compaction dominating background I/O
    telemetry.set_backlog(Backlog {
        write_buffers: 1,
        l0_files: 40,
    });

    for _ in 0..3 {
        telemetry.record_flush(MIB as u64);
        telemetry.record_compaction(4 * MIB as u64, 4 * MIB as u64);
        for _ in 0..10 {
            clock.advance(1_000);
            throttle.request(100_000);
        }
    }

    let stats = throttle.stats();
    assert_eq!(stats.tune_cycles, 3);

    let tuned: Vec<_> = meter
        .kinds()
        .into_iter()
        .filter_map(|k| match k {
            ThrottleKind::RateTuned {
                observed_rate,
                new_rate,
                max_rate,
                l0_files,
                ..
            } => Some((observed_rate, new_rate, max_rate, l0_files)),
            _ => None,
        })
        .collect();
    assert_eq!(tuned.len(), 3);

    for (observed, new_rate, max_rate, l0_files) in tuned {
        assert_eq!(l0_files, 40);
        assert!(new_rate <= max_rate);
        // L0 estimate is 48/80 of observed; compaction dominates the blend
        assert!(new_rate < observed);
    }
    assert!(stats.rate_bytes_per_sec <= stats.max_rate_bytes_per_sec);
}

#[test]
fn test_idle_background_blends_evenly() {
    let config = ThrottleConfig {
        tune_requests: 5,
        ..ThrottleConfig::default()
    };
    let (throttle, clock, telemetry, meter) = manual_throttle(config);
    telemetry.record_flush(10 * MIB as u64);
    telemetry.record_compaction(10 * MIB as u64, 10 * MIB as u64);
    clock.set(100_000);

    // Baseline sampled on the first request; no background I/O afterwards
    for _ in 0..5 {
        clock.advance(1_000);
        throttle.request(1_000);
    }

    let weights: Vec<f64> = meter
        .kinds()
        .into_iter()
        .filter_map(|k| match k {
            ThrottleKind::RateTuned { flush_weight, .. } => Some(flush_weight),
            _ => None,
        })
        .collect();
    assert_eq!(weights, vec![0.5]);
}
