//! nori-throttle: adaptive write-admission rate limiter for LSM shards.
//!
//! A token bucket sits in front of the write path and admits bytes at a
//! target rate. Every `tune_requests` admitted requests the target is
//! recomputed from engine feedback:
//! - Write-buffer backlog (memtables waiting to flush)
//! - L0 backlog (files waiting for compaction)
//! - Write amplification (flush + compaction bytes per admitted byte)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Writer threads ── request(bytes) ──┐                        │
//! │                                     ↓                        │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ TokenBucket                                            │  │
//! │  │  - CAS debit of available bytes                        │  │
//! │  │  - refill_bytes_per_period credited every period       │  │
//! │  │  - one credit per period (mutex + condvar)             │  │
//! │  └───────────────▲────────────────────────────────────────┘  │
//! │                  │ install_rate (every Nth request)          │
//! │  ┌───────────────┴────────────────────────────────────────┐  │
//! │  │ RateController                                         │  │
//! │  │  - observed rate x backlog ratios, blended by I/O mix  │  │
//! │  │  - capped at max(min_rate, reference / write-amp)      │  │
//! │  └───────────────▲────────────────────────────────────────┘  │
//! │                  │ polled                                    │
//! │            EngineTelemetry                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nori_throttle::{AtomicTelemetry, ThrottleConfig, WriteThrottle};
//! use std::sync::Arc;
//!
//! let telemetry = Arc::new(AtomicTelemetry::default());
//! let throttle = Arc::new(WriteThrottle::new(ThrottleConfig::default(), telemetry.clone())?);
//! throttle.start();
//!
//! // On each write batch
//! throttle.request(4096);
//!
//! // As the engine flushes and compacts
//! telemetry.record_flush(64 * 1024 * 1024);
//! # Ok::<(), nori_throttle::Error>(())
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod limiter;
pub mod telemetry;

pub use bucket::{calculate_refill_bytes_per_period, Admission, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FallbackIoConfig, ThrottleConfig};
pub use controller::{calculate_max_rate, ControllerSnapshot, RateController, TuneDecision};
pub use error::{Error, Result};
pub use limiter::{ThrottleStats, WriteThrottle};
pub use telemetry::{AtomicTelemetry, Backlog, BacklogThresholds, EngineTelemetry, IoCounters};

// Re-export key types from dependencies
pub use nori_observe::{Meter, NoopMeter};
