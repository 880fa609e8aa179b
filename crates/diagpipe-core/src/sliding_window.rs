//! Fixed-duration rolling counter of timestamped occurrences.
//!
//! [`SlidingWindow`] retains a sequence of (timestamp, count) buckets and a
//! running total. Data points landing within one second of the last bucket
//! coalesce into it rather than appending; every insertion evicts buckets
//! that have aged out of the window relative to the most recent data point.
//!
//! Single-threaded per instance; callers supply external synchronization if
//! an instance is shared. Timestamps must arrive in non-decreasing order
//! (caller contract): debug builds assert, release builds clamp the incoming
//! timestamp to the last-seen value and treat the points as simultaneous.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Near-simultaneous data points merge into the same bucket.
const COALESCING_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Timestamp of the first data point merged into this bucket.
    timestamp: DateTime<Utc>,
    count: u64,
}

/// Rolling occurrence counter over a fixed time window.
#[derive(Debug)]
pub struct SlidingWindow {
    window: TimeDelta,
    buckets: VecDeque<Bucket>,
    count: u64,
    latest: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Create a window retaining data points for `window` relative to the
    /// most recent observation.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            buckets: VecDeque::new(),
            count: 0,
            latest: None,
        }
    }

    /// Total occurrences currently inside the window.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Record one occurrence at `timestamp`.
    ///
    /// Requires `timestamp` to be >= the last added timestamp.
    pub fn add_data_point(&mut self, timestamp: DateTime<Utc>) {
        let timestamp = match self.latest {
            Some(latest) => {
                debug_assert!(timestamp >= latest, "data points must be non-decreasing");
                timestamp.max(latest)
            }
            None => timestamp,
        };

        match self.buckets.back_mut() {
            Some(last)
                if (timestamp - last.timestamp)
                    < TimeDelta::milliseconds(COALESCING_INTERVAL_MS) =>
            {
                last.count += 1;
            }
            _ => {
                self.buckets.push_back(Bucket {
                    timestamp,
                    count: 1,
                });
            }
        }

        self.count += 1;
        self.latest = Some(timestamp);
        self.evict(timestamp);
    }

    /// Reset to empty.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.count = 0;
        self.latest = None;
    }

    /// Drop buckets whose timestamp has aged past `latest - window`.
    fn evict(&mut self, latest: DateTime<Utc>) {
        let cutoff = latest - self.window;
        while let Some(front) = self.buckets.front() {
            if front.timestamp < cutoff {
                self.count -= front.count;
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
