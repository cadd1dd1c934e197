// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use crate::Time;

/// Simple static timesource that will always return the same time
#[derive(Debug, Clone, Copy)]
pub struct StaticTimeSource {
    now: SystemTime,
    now_instant: Instant,
}

impl StaticTimeSource {
    /// Create a new StaticTimeSource that always returns the given time
    ///
    /// # Examples
    ///
    /// ```
    /// use callstats_timesource::{TimeSource, fakes::StaticTimeSource};
    /// use std::time::UNIX_EPOCH;
    ///
    /// let ts = TimeSource::custom(StaticTimeSource::at_time(UNIX_EPOCH));
    /// assert_eq!(ts.unix_millis(), 0);
    /// ```
    pub fn at_time(time: impl Into<SystemTime>) -> Self {
        Self {
            now: time.into(),
            now_instant: Instant::now(),
        }
    }
}

impl Time for StaticTimeSource {
    fn now(&self) -> SystemTime {
        self.now
    }

    fn instant(&self) -> Instant {
        self.now_instant
    }
}

/// Clock that only moves when told to
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// code under test and keep another to drive it.
#[derive(Debug, Clone)]
pub struct ManuallyAdvancedTimeSource(Arc<Mutex<StaticTimeSource>>);

impl ManuallyAdvancedTimeSource {
    /// Create a clock started at the given time
    ///
    /// # Examples
    ///
    /// ```
    /// use callstats_timesource::{TimeSource, fakes::ManuallyAdvancedTimeSource};
    /// use std::time::{Duration, UNIX_EPOCH};
    ///
    /// let clock = ManuallyAdvancedTimeSource::at_time(UNIX_EPOCH);
    /// let ts = TimeSource::custom(clock.clone());
    /// clock.advance(Duration::from_secs(3));
    /// assert_eq!(ts.unix_millis(), 3_000);
    /// ```
    pub fn at_time(time: impl Into<SystemTime>) -> Self {
        Self(Arc::new(Mutex::new(StaticTimeSource::at_time(time))))
    }

    /// Move both the wall clock and the monotonic instant forward
    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        guard.now += by;
        guard.now_instant += by;
    }
}

impl Time for ManuallyAdvancedTimeSource {
    fn now(&self) -> SystemTime {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).now
    }

    fn instant(&self) -> Instant {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).now_instant
    }
}
