//! Clock implementations

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use strand_core::Timestamp;

/// Source of logical timestamps
pub trait Clock: Send + Sync {
    /// Current timestamp
    /// INVARIANT: strictly greater than every value previously returned
    fn now(&self) -> Timestamp;
}

/// Wall clock made monotonic per process
pub struct SystemClock {
    last: Mutex<Timestamp>,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            last: Mutex::new(Timestamp::ZERO),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // Before the epoch only happens on a broken host clock; fall back to
        // the last issued value so monotonicity still holds.
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Timestamp::from_unix)
            .unwrap_or(Timestamp::ZERO);

        let mut last = self.last.lock();
        let next = if wall > *last { wall } else { last.next_tick() };
        *last = next;
        next
    }
}

/// Manually driven clock for tests
///
/// Every call to `now` returns the current value and then advances it by
/// `step`, so consecutive timestamps stay strictly increasing.
pub struct ManualClock {
    value: Mutex<Timestamp>,
    step: Duration,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self::with_step(start, Duration::from_millis(1))
    }

    pub fn with_step(start: Timestamp, step: Duration) -> Self {
        ManualClock {
            value: Mutex::new(start),
            step,
        }
    }

    /// Jump forward
    pub fn advance(&self, by: Duration) {
        let mut value = self.value.lock();
        *value = value.saturating_add(by);
    }

    /// Value the next call to `now` will return
    pub fn peek(&self) -> Timestamp {
        *self.value.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut value = self.value.lock();
        let current = *value;
        let next = value.saturating_add(self.step);
        *value = if next > current { next } else { current.next_tick() };
        current
    }
}
