//! Computes sliding averages of performance measurements.
//!
//! The server records the duration of every handled command per connection. As these
//! recordings happen on the hot path, the whole structure is lock and wait free: the
//! sliding sum and its count share a single `u64` (32 bits each), which is read,
//! adjusted and stored with plain atomic operations.
//!
//! # Example
//!
//! ```
//! # use ganymede::average::Average;
//! let avg = Average::new();
//! avg.add(10);
//! avg.add(20);
//! avg.add(30);
//!
//! assert_eq!(avg.avg(), 20);
//! assert_eq!(avg.count(), 3);
//! ```
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fmt::format_micros;

/// A sliding average over roughly the last 100 recorded values.
///
/// Additionally keeps a total count of all recordings. Overflows degrade gracefully:
/// once the packed sum would overflow, sum and count are halved, which keeps the
/// average stable while forgetting old values a bit faster.
#[derive(Default)]
pub struct Average {
    sum_and_count: AtomicU64,
    count: AtomicU64,
}

impl Average {
    /// Creates a new average without any recordings.
    pub fn new() -> Average {
        Average::default()
    }

    fn unpack(&self) -> (i32, i32) {
        let packed = self.sum_and_count.load(Ordering::Relaxed);
        (((packed >> 32) & 0xFFFF_FFFF) as i32, (packed & 0xFFFF_FFFF) as i32)
    }

    /// Records another value (commonly a duration in microseconds).
    ///
    /// Note that concurrent recordings may overwrite each other's contribution to the
    /// sliding window. That is a deliberate trade: the value here is a monitoring
    /// metric, and losing an occasional sample is preferable to a lock on every
    /// handled command.
    pub fn add(&self, value: i32) {
        let _ = self.count.fetch_add(1, Ordering::Relaxed);

        let (mut sum, mut count) = self.unpack();

        // Shrink the window once it is full or the sum would overflow...
        while count > 100 || sum as i64 + value as i64 > i32::MAX as i64 {
            sum = count / 2 * sum / count;
            count /= 2;
        }

        sum += value;
        count += 1;

        let packed = ((sum as u64) & 0xFFFF_FFFF) << 32 | ((count as u64) & 0xFFFF_FFFF);
        self.sum_and_count.store(packed, Ordering::Relaxed);
    }

    /// Returns the sliding average of the recently recorded values.
    pub fn avg(&self) -> i32 {
        let (sum, count) = self.unpack();
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            sum_and_count: AtomicU64::new(self.sum_and_count.load(Ordering::Relaxed)),
            count: AtomicU64::new(self.count.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}
