// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use callstats_timesource::TimeSource;

/// Measures how long a call took, minus time spent waiting on calls it made elsewhere
///
/// Services that delegate part of their work to another instrumented service exclude
/// that sub-call, so the hourly histogram reflects time spent in their own layer.
#[derive(Debug, Clone)]
pub struct CallTimer {
    time_source: TimeSource,
    start: Instant,
    excluded: Duration,
}

impl CallTimer {
    /// Start timing now
    pub fn start(time_source: TimeSource) -> Self {
        let start = time_source.instant();
        Self {
            time_source,
            start,
            excluded: Duration::ZERO,
        }
    }

    /// Discount `elapsed` from the measured time
    pub fn exclude(&mut self, elapsed: Duration) {
        self.excluded = self.excluded.saturating_add(elapsed);
    }

    /// Run `f` and discount however long it took
    pub fn exclude_while<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let start = self.time_source.instant();
        let result = f();
        self.exclude(self.time_source.elapsed_since(start));
        result
    }

    /// Total time excluded so far
    pub fn excluded(&self) -> Duration {
        self.excluded
    }

    /// Time since [`CallTimer::start`] minus excluded time, never below zero
    pub fn elapsed(&self) -> Duration {
        self.time_source
            .elapsed_since(self.start)
            .saturating_sub(self.excluded)
    }
}
