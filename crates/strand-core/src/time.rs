//! Logical timestamps
//!
//! Timestamps are `(secs, nanos)` pairs. Ordering is lexicographic, which the
//! derived `Ord` gives us through field order.

use std::ops::Sub;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Logical timestamp, monotonic per process when produced by a `Clock`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    /// Build a timestamp, carrying overflowing nanoseconds into seconds
    pub fn new(secs: i64, nanos: u32) -> Self {
        Timestamp {
            secs: secs + (nanos / NANOS_PER_SEC) as i64,
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    #[inline]
    pub fn from_secs(secs: i64) -> Self {
        Timestamp { secs, nanos: 0 }
    }

    /// Timestamp from a duration since the Unix epoch
    pub fn from_unix(since_epoch: Duration) -> Self {
        Timestamp {
            secs: since_epoch.as_secs() as i64,
            nanos: since_epoch.subsec_nanos(),
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// Smallest timestamp strictly greater than `self`
    pub fn next_tick(self) -> Self {
        if self.nanos + 1 >= NANOS_PER_SEC {
            Timestamp {
                secs: self.secs + 1,
                nanos: 0,
            }
        } else {
            Timestamp {
                secs: self.secs,
                nanos: self.nanos + 1,
            }
        }
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = self.nanos as u64 + duration.subsec_nanos() as u64;
        let secs = self
            .secs
            .saturating_add(duration.as_secs().min(i64::MAX as u64) as i64)
            .saturating_add((nanos / NANOS_PER_SEC as u64) as i64);
        Timestamp {
            secs,
            nanos: (nanos % NANOS_PER_SEC as u64) as u32,
        }
    }

    fn as_nanos(self) -> i128 {
        self.secs as i128 * NANOS_PER_SEC as i128 + self.nanos as i128
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    /// Elapsed time between two timestamps, zero when `rhs` is later
    fn sub(self, rhs: Timestamp) -> Self::Output {
        let diff = self.as_nanos() - rhs.as_nanos();
        if diff > 0 {
            Duration::from_nanos(diff.min(u64::MAX as i128) as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ts({}.{:09})", self.secs, self.nanos)
    }
}
