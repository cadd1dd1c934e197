// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

mod bucket;

pub use bucket::{HOUR_MILLIS, TimeBucket, TimeBucketResolver};

/// Module containing fake time sources for testing
///
/// To enable this module, you must enable the `test-util` feature.
#[cfg(feature = "test-util")]
pub mod fakes;

/// Trait for providing custom time sources
///
/// Implementors of this trait can be used to provide custom time behavior
/// for testing or specialized use cases.
pub trait Time: Send + Sync + Debug {
    /// Get the current system time
    fn now(&self) -> SystemTime;

    /// Get the current instant
    fn instant(&self) -> Instant;
}

/// Where a component reads the clock from
///
/// Cloning is cheap: a custom source is shared behind an [`Arc`].
#[derive(Clone, Default)]
pub enum TimeSource {
    /// Use the system clock
    #[default]
    System,
    /// Use a custom time source
    Custom(Arc<dyn Time>),
}

impl Debug for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "TimeSource::System"),
            Self::Custom(_) => write!(f, "TimeSource::Custom(...)"),
        }
    }
}

impl TimeSource {
    /// Create a new TimeSource with a custom time implementation
    ///
    /// # Examples
    ///
    /// ```
    /// use callstats_timesource::{TimeSource, fakes::StaticTimeSource};
    /// use std::time::UNIX_EPOCH;
    ///
    /// let ts = TimeSource::custom(StaticTimeSource::at_time(UNIX_EPOCH));
    /// assert_eq!(ts.system_time(), UNIX_EPOCH);
    /// ```
    pub fn custom(custom: impl Time + 'static) -> TimeSource {
        Self::Custom(Arc::new(custom))
    }

    /// Get the current wall-clock time from this time source
    pub fn system_time(&self) -> SystemTime {
        match self {
            Self::System => SystemTime::now(),
            Self::Custom(ts) => ts.now(),
        }
    }

    /// Get the current monotonic instant from this time source
    pub fn instant(&self) -> Instant {
        match self {
            Self::System => Instant::now(),
            Self::Custom(ts) => ts.instant(),
        }
    }

    /// Milliseconds since the Unix epoch, negative for times before it
    ///
    /// Deadlines and calendar buckets are all expressed in this unit.
    pub fn unix_millis(&self) -> i64 {
        to_unix_millis(self.system_time())
    }

    /// Time elapsed since `start`, which must come from this same source
    pub fn elapsed_since(&self, start: Instant) -> Duration {
        self.instant().saturating_duration_since(start)
    }
}

/// Convert a [`SystemTime`] into signed milliseconds since the Unix epoch
pub fn to_unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_millis())
            .map(|ms| -ms)
            .unwrap_or(i64::MIN),
    }
}
