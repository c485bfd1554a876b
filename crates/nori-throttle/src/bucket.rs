//! Token store: byte balance plus a periodic refill schedule.
//!
//! # Refill Protocol
//! 1. Fast path: compare-and-swap debit of the balance, no lock.
//! 2. Slow path: take the schedule lock and re-try the debit (a credit may
//!    have landed meanwhile).
//! 3. If the refill deadline has passed, advance it and credit one period's
//!    bytes, then wake all waiters.
//! 4. Otherwise wait on the condvar until the deadline, and loop.
//!
//! The deadline check and the credit happen under the same lock, so each
//! period is credited exactly once no matter how many writers straddle the
//! boundary.
//!
//! # Invariants
//! - The balance is only debited when it covers the whole request; it never
//!   goes below zero through a debit.
//! - `next_refill_us` never decreases.
//! - Once stopped, no debit or credit is applied.

use crate::clock::{micros_to_duration, Clock};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Smallest credit per period, whatever the target rate.
pub const MIN_REFILL_BYTES_PER_PERIOD: i64 = 100;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Bytes credited per refill period for `rate_bytes_per_sec`.
///
/// `max(100, rate * period_us / 1e6)`, or `i64::MAX / 1e6` when the
/// product would overflow.
pub fn calculate_refill_bytes_per_period(rate_bytes_per_sec: i64, refill_period_us: i64) -> i64 {
    if rate_bytes_per_sec <= 0 || refill_period_us <= 0 {
        return MIN_REFILL_BYTES_PER_PERIOD;
    }
    if i64::MAX / rate_bytes_per_sec < refill_period_us {
        // Still inaccurate, but large enough to never throttle.
        return i64::MAX / MICROS_PER_SEC;
    }
    (rate_bytes_per_sec * refill_period_us / MICROS_PER_SEC).max(MIN_REFILL_BYTES_PER_PERIOD)
}

/// How a request left the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Balance covered the request on arrival (or after a refill this thread applied).
    Immediate,
    /// The writer slept for at least one refill deadline.
    AfterWait { waited_us: u64 },
    /// Bucket was stopped; nothing was accounted.
    Bypassed,
}

#[derive(Debug)]
struct RefillSchedule {
    next_refill_us: i64,
}

impl RefillSchedule {
    /// Moves the deadline one period forward, or re-anchors it on `now_us`
    /// when a whole period or more was missed. Missed periods are not
    /// credited retroactively.
    fn advance(&mut self, now_us: i64, period_us: i64) {
        let next = self.next_refill_us.saturating_add(period_us);
        self.next_refill_us = if next > now_us {
            next
        } else {
            now_us.saturating_add(period_us)
        };
    }
}

/// Shared byte bucket for one shard's writers.
#[derive(Debug)]
pub struct TokenBucket {
    available_bytes: AtomicI64,

    refill_period_us: i64,
    refill_bytes_per_period: AtomicI64,

    /// Target and ceiling installed by the rate controller
    rate_bytes_per_sec: AtomicI64,
    max_rate_bytes_per_sec: AtomicI64,

    total_requests: AtomicU64,
    total_bytes_through: AtomicI64,
    /// `total_bytes_through` at the last tuning point
    last_bytes_through: AtomicI64,
    /// Time of the last tuning point
    tune_time_us: AtomicI64,

    refills_applied: AtomicU64,
    stopped: AtomicBool,

    schedule: Mutex<RefillSchedule>,
    refilled: Condvar,
}

impl TokenBucket {
    /// Creates an empty bucket. The first credit is due one period after `now_us`.
    pub fn new(refill_period_us: i64, rate_bytes_per_sec: i64, now_us: i64) -> Self {
        Self {
            available_bytes: AtomicI64::new(0),
            refill_period_us,
            refill_bytes_per_period: AtomicI64::new(calculate_refill_bytes_per_period(
                rate_bytes_per_sec,
                refill_period_us,
            )),
            rate_bytes_per_sec: AtomicI64::new(rate_bytes_per_sec),
            max_rate_bytes_per_sec: AtomicI64::new(rate_bytes_per_sec),
            total_requests: AtomicU64::new(0),
            total_bytes_through: AtomicI64::new(0),
            last_bytes_through: AtomicI64::new(0),
            tune_time_us: AtomicI64::new(now_us),
            refills_applied: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            schedule: Mutex::new(RefillSchedule {
                next_refill_us: now_us.saturating_add(refill_period_us),
            }),
            refilled: Condvar::new(),
        }
    }

    /// Resets the tuning clock and first deadline to `now_us` and installs `rate_bytes_per_sec`.
    pub fn start(&self, now_us: i64, rate_bytes_per_sec: i64) {
        self.tune_time_us.store(now_us, Ordering::Release);
        {
            let mut schedule = self.schedule.lock();
            schedule.next_refill_us = schedule
                .next_refill_us
                .max(now_us.saturating_add(self.refill_period_us));
        }
        self.install_rate(rate_bytes_per_sec);
    }

    /// Installs a new target rate and returns the refill quantity derived from it.
    ///
    /// Takes effect at the next credit; an already scheduled deadline is kept.
    pub fn install_rate(&self, rate_bytes_per_sec: i64) -> i64 {
        let refill = calculate_refill_bytes_per_period(rate_bytes_per_sec, self.refill_period_us);
        self.rate_bytes_per_sec
            .store(rate_bytes_per_sec, Ordering::Release);
        self.refill_bytes_per_period.store(refill, Ordering::Release);
        refill
    }

    pub fn set_max_rate(&self, max_rate_bytes_per_sec: i64) {
        self.max_rate_bytes_per_sec
            .store(max_rate_bytes_per_sec, Ordering::Release);
    }

    /// Zeroes throughput counters and restarts the tuning clock at `now_us`.
    pub fn reset_throughput(&self, now_us: i64) {
        self.tune_time_us.store(now_us, Ordering::Release);
        self.total_bytes_through.store(0, Ordering::Release);
        self.last_bytes_through.store(0, Ordering::Release);
    }

    /// Moves the throughput baseline to `bytes_through` and restarts the tuning clock.
    pub fn mark_tuned(&self, now_us: i64, bytes_through: i64) {
        self.tune_time_us.store(now_us, Ordering::Release);
        self.last_bytes_through.store(bytes_through, Ordering::Release);
    }

    /// Counts one request and returns the new total.
    pub fn count_request(&self) -> u64 {
        self.total_requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Blocks until `bytes` tokens are debited or the bucket is stopped.
    pub fn acquire(&self, bytes: u64, clock: &dyn Clock) -> Admission {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        let mut waited_since: Option<i64> = None;

        loop {
            if self.is_stopped() {
                return Admission::Bypassed;
            }
            if self.try_debit(bytes) {
                break;
            }

            let mut schedule = self.schedule.lock();
            if self.is_stopped() {
                return Admission::Bypassed;
            }
            if self.try_debit(bytes) {
                break;
            }

            let now = clock.now_micros();
            if now >= schedule.next_refill_us {
                schedule.advance(now, self.refill_period_us);
                let credit = self.refill_bytes_per_period.load(Ordering::Acquire);
                self.credit(credit);
                self.refills_applied.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(
                    credit,
                    next_refill_us = schedule.next_refill_us,
                    "token bucket refilled"
                );
                self.refilled.notify_all();
                continue;
            }

            waited_since.get_or_insert(now);
            let wait = micros_to_duration(schedule.next_refill_us - now);
            self.refilled.wait_for(&mut schedule, wait);
        }

        self.total_bytes_through.fetch_add(bytes, Ordering::AcqRel);

        match waited_since {
            None => Admission::Immediate,
            Some(since) => Admission::AfterWait {
                waited_us: u64::try_from(clock.now_micros() - since).unwrap_or(0),
            },
        }
    }

    /// Permanently disables the bucket and wakes every waiter.
    ///
    /// Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::AcqRel);
        // Taking the lock orders the flag before any waiter's re-check.
        let _schedule = self.schedule.lock();
        self.refilled.notify_all();
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> i64 {
        self.available_bytes.load(Ordering::Acquire)
    }

    pub fn refill_period_us(&self) -> i64 {
        self.refill_period_us
    }

    pub fn refill_bytes_per_period(&self) -> i64 {
        self.refill_bytes_per_period.load(Ordering::Acquire)
    }

    pub fn rate_bytes_per_sec(&self) -> i64 {
        self.rate_bytes_per_sec.load(Ordering::Acquire)
    }

    pub fn max_rate_bytes_per_sec(&self) -> i64 {
        self.max_rate_bytes_per_sec.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    pub fn total_bytes_through(&self) -> i64 {
        self.total_bytes_through.load(Ordering::Acquire)
    }

    pub fn last_bytes_through(&self) -> i64 {
        self.last_bytes_through.load(Ordering::Acquire)
    }

    pub fn tune_time_us(&self) -> i64 {
        self.tune_time_us.load(Ordering::Acquire)
    }

    pub fn next_refill_us(&self) -> i64 {
        self.schedule.lock().next_refill_us
    }

    pub fn refills_applied(&self) -> u64 {
        self.refills_applied.load(Ordering::Acquire)
    }

    /// Debits `bytes` only if the balance covers it.
    fn try_debit(&self, bytes: i64) -> bool {
        self.available_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                (available >= bytes).then(|| available - bytes)
            })
            .is_ok()
    }

    fn credit(&self, bytes: i64) {
        let _ = self
            .available_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                Some(available.saturating_add(bytes))
            });
    }
}
