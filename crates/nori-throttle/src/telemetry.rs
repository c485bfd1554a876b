//! Engine feedback consumed by the rate controller.
//!
//! The throttle does not know how the engine flushes or compacts; it polls an
//! [`EngineTelemetry`] handle once per tuning cycle. Thresholds are read fresh
//! every cycle because column-family options may change at runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Current backlog of the shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    /// Immutable write buffers not yet flushed
    pub write_buffers: u64,
    /// Files at level 0
    pub l0_files: u64,
}

/// Column-family thresholds the backpressure law is calibrated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogThresholds {
    pub max_write_buffer_number: u64,
    pub min_write_buffer_number_to_merge: u64,
    pub level0_slowdown_writes_trigger: u64,
    pub level0_file_num_compaction_trigger: u64,
}

impl Default for BacklogThresholds {
    fn default() -> Self {
        Self {
            max_write_buffer_number: 2,
            min_write_buffer_number_to_merge: 1,
            level0_slowdown_writes_trigger: 20,
            level0_file_num_compaction_trigger: 4,
        }
    }
}

/// Cumulative background I/O since the engine opened. Monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    /// Bytes written by memtable flushes
    pub flush_bytes: u64,
    /// Bytes read plus bytes written by compactions
    pub compaction_bytes: u64,
}

impl IoCounters {
    pub fn total(&self) -> u64 {
        self.flush_bytes.saturating_add(self.compaction_bytes)
    }

    /// Per-counter delta since `baseline`. Counter resets read as zero.
    pub fn since(&self, baseline: &IoCounters) -> IoCounters {
        IoCounters {
            flush_bytes: self.flush_bytes.saturating_sub(baseline.flush_bytes),
            compaction_bytes: self.compaction_bytes.saturating_sub(baseline.compaction_bytes),
        }
    }
}

/// Read-only view of the engine, polled at tuning time.
pub trait EngineTelemetry: Send + Sync {
    fn backlog(&self) -> Backlog;

    fn thresholds(&self) -> BacklogThresholds;

    /// `None` when the engine runs without statistics.
    fn io_counters(&self) -> Option<IoCounters>;
}

/// Telemetry cell the engine updates in place as flushes and compactions run.
#[derive(Debug)]
pub struct AtomicTelemetry {
    write_buffers: AtomicU64,
    l0_files: AtomicU64,
    max_write_buffer_number: AtomicU64,
    min_write_buffer_number_to_merge: AtomicU64,
    level0_slowdown_writes_trigger: AtomicU64,
    level0_file_num_compaction_trigger: AtomicU64,
    flush_bytes: AtomicU64,
    compaction_bytes: AtomicU64,
    statistics_enabled: AtomicBool,
}

impl AtomicTelemetry {
    pub fn new(thresholds: BacklogThresholds) -> Self {
        Self {
            write_buffers: AtomicU64::new(0),
            l0_files: AtomicU64::new(0),
            max_write_buffer_number: AtomicU64::new(thresholds.max_write_buffer_number),
            min_write_buffer_number_to_merge: AtomicU64::new(
                thresholds.min_write_buffer_number_to_merge,
            ),
            level0_slowdown_writes_trigger: AtomicU64::new(
                thresholds.level0_slowdown_writes_trigger,
            ),
            level0_file_num_compaction_trigger: AtomicU64::new(
                thresholds.level0_file_num_compaction_trigger,
            ),
            flush_bytes: AtomicU64::new(0),
            compaction_bytes: AtomicU64::new(0),
            statistics_enabled: AtomicBool::new(true),
        }
    }

    pub fn set_backlog(&self, backlog: Backlog) {
        self.write_buffers.store(backlog.write_buffers, Ordering::Relaxed);
        self.l0_files.store(backlog.l0_files, Ordering::Relaxed);
    }

    pub fn set_thresholds(&self, t: BacklogThresholds) {
        self.max_write_buffer_number
            .store(t.max_write_buffer_number, Ordering::Relaxed);
        self.min_write_buffer_number_to_merge
            .store(t.min_write_buffer_number_to_merge, Ordering::Relaxed);
        self.level0_slowdown_writes_trigger
            .store(t.level0_slowdown_writes_trigger, Ordering::Relaxed);
        self.level0_file_num_compaction_trigger
            .store(t.level0_file_num_compaction_trigger, Ordering::Relaxed);
    }

    /// Records bytes written by a finished flush.
    pub fn record_flush(&self, bytes: u64) {
        self.flush_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records bytes read and written by a finished compaction.
    pub fn record_compaction(&self, read_bytes: u64, write_bytes: u64) {
        self.compaction_bytes
            .fetch_add(read_bytes.saturating_add(write_bytes), Ordering::Relaxed);
    }

    pub fn set_statistics_enabled(&self, enabled: bool) {
        self.statistics_enabled.store(enabled, Ordering::Relaxed);
    }
}

impl Default for AtomicTelemetry {
    fn default() -> Self {
        Self::new(BacklogThresholds::default())
    }
}

impl EngineTelemetry for AtomicTelemetry {
    fn backlog(&self) -> Backlog {
        Backlog {
            write_buffers: self.write_buffers.load(Ordering::Relaxed),
            l0_files: self.l0_files.load(Ordering::Relaxed),
        }
    }

    fn thresholds(&self) -> BacklogThresholds {
        BacklogThresholds {
            max_write_buffer_number: self.max_write_buffer_number.load(Ordering::Relaxed),
            min_write_buffer_number_to_merge: self
                .min_write_buffer_number_to_merge
                .load(Ordering::Relaxed),
            level0_slowdown_writes_trigger: self
                .level0_slowdown_writes_trigger
                .load(Ordering::Relaxed),
            level0_file_num_compaction_trigger: self
                .level0_file_num_compaction_trigger
                .load(Ordering::Relaxed),
        }
    }

    fn io_counters(&self) -> Option<IoCounters> {
        if !self.statistics_enabled.load(Ordering::Relaxed) {
            return None;
        }
        Some(IoCounters {
            flush_bytes: self.flush_bytes.load(Ordering::Relaxed),
            compaction_bytes: self.compaction_bytes.load(Ordering::Relaxed),
        })
    }
}
