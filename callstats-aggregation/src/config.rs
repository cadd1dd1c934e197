// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine tuning

use std::time::Duration;

/// Flush pacing for a [`crate::WriteBackEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    flush_interval: Duration,
    max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            max_batch_size: 100,
        }
    }
}

impl EngineConfig {
    /// Defaults: a 60 second interval and batches of 100 rows
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum time between the end of one persistence pass and the next snapshot.
    ///
    /// Also the backoff applied after a failed batch. Increments stay in memory for up
    /// to this long past the deadline, until the next caller happens to trigger a flush.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "flush interval must be positive");
        self.flush_interval = interval;
        self
    }

    /// Maximum number of rows one caller writes per opportunistic flush.
    ///
    /// Bounds how much I/O any single instrumented call absorbs.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        assert!(size > 0, "batch size must be positive");
        self.max_batch_size = size;
        self
    }

    /// The configured flush interval
    pub fn interval(&self) -> Duration {
        self.flush_interval
    }

    /// The configured batch size
    pub fn batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub(crate) fn interval_millis(&self) -> i64 {
        i64::try_from(self.flush_interval.as_millis()).unwrap_or(i64::MAX)
    }
}
