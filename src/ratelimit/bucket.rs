//! Token bucket implemented with virtual scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// A token bucket holding up to `burst` tokens, refilled at `rate` per second.
///
/// The fill level is not stored directly. Instead the bucket tracks the
/// theoretical arrival time (`tat`) of the next request under a perfectly
/// paced schedule: every reservation pushes it forward by one emission
/// interval, and a request is conforming while `tat - burst * interval` is not
/// in the future. This makes reserve-then-cancel exact: cancelling simply
/// rewinds `tat` by the interval that was added.
#[derive(Debug)]
pub struct Bucket {
    rate: f64,
    burst: u32,
    /// Time between two tokens
    interval: Duration,
    /// How far `tat` may run ahead of now while still conforming
    tolerance: Duration,
    tat: Mutex<Duration>,
    /// Unix seconds of the last access
    last_used: AtomicU64,
}

/// A provisional token consumption.
///
/// A reservation with a zero [`delay`](Reservation::delay) holds a token that
/// is usable now. Otherwise the token only becomes valid after the delay, and
/// callers that do not intend to wait hand it back with [`Bucket::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reservation that is not used must be cancelled"]
pub struct Reservation {
    delay: Duration,
    interval: Duration,
}

impl Reservation {
    /// How long until the reserved token is valid.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_ready(&self) -> bool {
        self.delay.is_zero()
    }
}

/// Emission interval and burst tolerance for `rate` and `burst`, or `None`
/// when either does not fit in a [`Duration`].
pub fn schedule(rate: f64, burst: u32) -> Option<(Duration, Duration)> {
    let interval = Duration::try_from_secs_f64(1.0 / rate).ok()?;
    let tolerance = interval.checked_mul(burst)?;
    Some((interval, tolerance))
}

impl Bucket {
    /// Create a full bucket.
    ///
    /// Rates rejected by [`schedule`] produce a bucket that never grants.
    pub fn new(rate: f64, burst: u32, now: Duration) -> Self {
        let (interval, tolerance) = schedule(rate, burst).unwrap_or((Duration::MAX, Duration::ZERO));
        let bucket = Self {
            rate,
            burst,
            interval,
            tolerance,
            tat: Mutex::new(now),
            last_used: AtomicU64::new(0),
        };
        bucket.touch(now);
        bucket
    }

    /// Take one token, reporting how long until it is valid.
    pub fn reserve(&self, now: Duration) -> Reservation {
        let mut tat = self.tat.lock();

        let Some(next) = (*tat).max(now).checked_add(self.interval) else {
            return Reservation {
                delay: Duration::MAX,
                interval: Duration::ZERO,
            };
        };
        let ready_at = next.saturating_sub(self.tolerance);
        *tat = next;

        Reservation {
            delay: ready_at.saturating_sub(now),
            interval: self.interval,
        }
    }

    /// Return a reserved token to the bucket.
    pub fn cancel(&self, reservation: Reservation) {
        let mut tat = self.tat.lock();
        *tat = tat.saturating_sub(reservation.interval);
    }

    /// Tokens available at `now`, between zero and `burst`.
    pub fn available(&self, now: Duration) -> f64 {
        let tat = *self.tat.lock();
        let horizon = now.saturating_add(self.tolerance);
        if tat >= horizon {
            return 0.0;
        }
        let spare = (horizon - tat).as_secs_f64() * self.rate;
        spare.min(self.burst as f64)
    }

    /// Record an access at `now`.
    pub fn touch(&self, now: Duration) {
        self.last_used.store(now.as_secs(), Ordering::Relaxed);
    }

    /// Unix seconds of the last access.
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}
