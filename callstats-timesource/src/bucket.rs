// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Calendar bucketing for aggregation keys.

use std::sync::{Mutex, PoisonError};

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, Timelike,
    Utc,
};

/// Milliseconds in one hour
pub const HOUR_MILLIS: i64 = 3_600_000;

/// Calendar attributes of one instant, as used to key counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBucket {
    /// Local calendar date
    pub date: NaiveDate,
    /// Local date and hour, with minutes and below truncated
    pub hour: NaiveDateTime,
    /// Days since Sunday, `0..=6`
    pub day_of_week: u8,
    /// Local hour, `0..=23`
    pub hour_of_day: u8,
}

#[derive(Debug, Clone, Copy)]
struct CachedBucket {
    bucket: TimeBucket,
    valid_from: i64,
    valid_until: i64,
}

impl CachedBucket {
    fn compute(offset: FixedOffset, unix_millis: i64) -> Self {
        // timestamps chrono cannot represent (beyond roughly ±262,000 years) land in the
        // epoch's bucket rather than failing the increment that asked for them
        let local = DateTime::from_timestamp_millis(unix_millis)
            .unwrap_or_default()
            .with_timezone(&offset)
            .naive_local();
        let date = local.date();
        let hour = date.and_time(NaiveTime::MIN) + TimeDelta::hours(i64::from(local.hour()));
        let hour_start = (hour - TimeDelta::seconds(i64::from(offset.local_minus_utc())))
            .and_utc()
            .timestamp_millis();

        Self {
            bucket: TimeBucket {
                date,
                hour,
                day_of_week: date.weekday().num_days_from_sunday() as u8,
                hour_of_day: local.hour() as u8,
            },
            valid_from: hour_start,
            // the final millisecond of each hour always recomputes
            valid_until: hour_start + HOUR_MILLIS - 1,
        }
    }

    fn covers(&self, unix_millis: i64) -> bool {
        self.valid_from <= unix_millis && unix_millis < self.valid_until
    }
}

/// Resolves timestamps into [`TimeBucket`]s in a fixed UTC offset
///
/// The most recent result is memoized for the rest of its hour, so the common
/// case of many calls within the same hour costs one lock and a range check.
/// The lock is never held for anything but that check and the recomputation.
#[derive(Debug)]
pub struct TimeBucketResolver {
    offset: FixedOffset,
    slot: Mutex<Option<CachedBucket>>,
}

impl Default for TimeBucketResolver {
    fn default() -> Self {
        Self::utc()
    }
}

impl TimeBucketResolver {
    /// Create a resolver computing local calendar fields in `offset`
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            slot: Mutex::new(None),
        }
    }

    /// Create a resolver working in UTC
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Resolve a Unix millisecond timestamp into its bucket
    pub fn resolve(&self, unix_millis: i64) -> TimeBucket {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match *slot {
            Some(cached) if cached.covers(unix_millis) => cached.bucket,
            _ => {
                let cached = CachedBucket::compute(self.offset, unix_millis);
                *slot = Some(cached);
                cached.bucket
            }
        }
    }

    #[cfg(test)]
    fn cached_range(&self) -> Option<(i64, i64)> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.map(|c| (c.valid_from, c.valid_until))
    }
}
