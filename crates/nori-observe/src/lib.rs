//! nori-observe: vendor-neutral observability ABI.
//!
//! Write-path crates depend only on these traits and event types. Backends live elsewhere.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and shards that don't export telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct Noop;
impl Counter for Noop {
    fn inc(&self, _v: u64) {}
}
impl Gauge for Noop {
    fn set(&self, _v: i64) {}
}
impl Histogram for Noop {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(Noop)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(Noop)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(Noop)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// Typed events for live visualization (payload bytes never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Throttle(ThrottleEvt),
}

/// Admission-throttle event for one shard's write path.
#[derive(Clone, Debug)]
pub struct ThrottleEvt {
    pub shard: u32,
    pub kind: ThrottleKind,
}

#[derive(Clone, Debug)]
pub enum ThrottleKind {
    /// First request on the shard; tuning clock and counters were reset
    Initialized { rate_bytes_per_sec: i64 },
    /// A tuning cycle committed a new admission rate
    RateTuned {
        observed_rate: i64,
        new_rate: i64,
        max_rate: i64,
        /// Flush share of background I/O for the interval (0.0-1.0)
        flush_weight: f64,
        write_buffers: u64,
        l0_files: u64,
    },
    /// A writer had to wait for a refill before being admitted
    Stalled { bytes: u64, waited_us: u64 },
    /// Limiter shut down; later requests bypass accounting
    Stopped { total_bytes_through: i64 },
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let __t = std::time::Instant::now();
        let __ret = { $body };
        let __ms = __t.elapsed().as_secs_f64() * 1000.0;
        $m.histo($name, &[], $labels).observe(__ms);
        __ret
    }};
}
