//! Bucket granularity
//!
//! Time-bucketing policy used to truncate and group row timestamps. The
//! engine never truncates directly when anchoring a merge: it asks for the
//! first bucket produced over the query start instead, so the
//! all-encompassing granularity anchors at the real interval start rather
//! than the truncation sentinel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Time-bucketing policy for grouping timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Granularity {
    /// One all-encompassing bucket
    All,

    /// Fixed-width buckets aligned to the epoch
    Duration {
        /// Bucket width in milliseconds
        millis: i64,
    },
}

impl Granularity {
    /// One-second buckets
    pub fn second() -> Self {
        Granularity::Duration { millis: 1_000 }
    }

    /// One-minute buckets
    pub fn minute() -> Self {
        Granularity::Duration { millis: 60_000 }
    }

    /// One-hour buckets
    pub fn hour() -> Self {
        Granularity::Duration { millis: 3_600_000 }
    }

    /// One-day buckets
    pub fn day() -> Self {
        Granularity::Duration { millis: 86_400_000 }
    }

    /// Truncate a timestamp to its bucket start.
    ///
    /// [`Granularity::All`] truncates everything to `i64::MIN`: every
    /// timestamp falls in the single bucket. Callers that need a concrete
    /// anchor must use [`Granularity::bucket_starts`] instead.
    pub fn truncate(&self, timestamp: i64) -> i64 {
        match self {
            Granularity::All => i64::MIN,
            Granularity::Duration { millis } => timestamp - timestamp.rem_euclid(*millis),
        }
    }

    /// Iterate bucket start timestamps covering `[start, end)`.
    ///
    /// For [`Granularity::All`] this yields `start` itself exactly once,
    /// which is what anchoring relies on.
    pub fn bucket_starts(&self, start: i64, end: i64) -> BucketStarts {
        let next = match self {
            Granularity::All => start,
            Granularity::Duration { .. } => self.truncate(start),
        };
        BucketStarts {
            granularity: self.clone(),
            next,
            end,
            done: start >= end,
        }
    }

    /// Convert a bucket timestamp back to a calendar datetime.
    ///
    /// Buckets are epoch-aligned, so this is a plain UTC conversion today;
    /// it stays granularity-owned so calendar-period bucketing with zone
    /// rules can slot in without touching the engine.
    pub fn to_datetime(&self, bucket: i64) -> DateTime<Utc> {
        match Utc.timestamp_millis_opt(bucket) {
            chrono::LocalResult::Single(dt) => dt,
            _ => DateTime::UNIX_EPOCH,
        }
    }
}

/// Iterator over bucket start timestamps
#[derive(Debug)]
pub struct BucketStarts {
    granularity: Granularity,
    next: i64,
    end: i64,
    done: bool,
}

impl Iterator for BucketStarts {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.done {
            return None;
        }
        match self.granularity {
            Granularity::All => {
                self.done = true;
                Some(self.next)
            }
            Granularity::Duration { millis } => {
                let current = self.next;
                match current.checked_add(millis) {
                    Some(next) => {
                        self.next = next;
                        self.done = next >= self.end;
                    }
                    None => self.done = true,
                }
                Some(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_truncate_aligns() {
        let gran = Granularity::minute();
        assert_eq!(gran.truncate(0), 0);
        assert_eq!(gran.truncate(60_001), 60_000);
        assert_eq!(gran.truncate(119_999), 60_000);
    }

    #[test]
    fn test_all_truncate_is_sentinel() {
        assert_eq!(Granularity::All.truncate(1_700_000_000_000), i64::MIN);
    }

    #[test]
    fn test_all_anchors_at_start() {
        // The anchoring pattern the merge engine uses: first bucket over
        // [t, t+1) must be t itself, never the sentinel.
        let start = 1_700_000_123_456;
        let first = Granularity::All.bucket_starts(start, start + 1).next();
        assert_eq!(first, Some(start));
    }

    #[test]
    fn test_duration_anchors_at_truncated_start() {
        let gran = Granularity::minute();
        let first = gran.bucket_starts(90_000, 90_001).next();
        assert_eq!(first, Some(60_000));
    }

    #[test]
    fn test_duration_bucket_iteration() {
        let gran = Granularity::minute();
        let buckets: Vec<i64> = gran.bucket_starts(30_000, 200_000).collect();
        assert_eq!(buckets, vec![0, 60_000, 120_000, 180_000]);
    }

    #[test]
    fn test_to_datetime_round_trips_millis() {
        let gran = Granularity::minute();
        let dt = gran.to_datetime(60_000);
        assert_eq!(dt.timestamp_millis(), 60_000);
    }
}
