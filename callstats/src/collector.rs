// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The collector facade handed to instrumented code

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use callstats_aggregation::{InvalidCounters, PersistError, StoreError, WriteBackEngine};
use callstats_timesource::{TimeBucketResolver, TimeSource};
use tracing::{debug, error};

use crate::{
    config::StatsConfig,
    dimension::Dimensions,
    error::StartupError,
    families::{
        CallSite, Outcome,
        daily::{DailyCounters, DailyKey, DailyRow, DailyWriter},
        hourly::{HourlyCounters, HourlyKey, HourlyRow, HourlyWriter},
    },
    schema,
    store::{ConnectionSource, SqliteFile, ping},
    timer::CallTimer,
};

/// Collects call statistics for one process
///
/// Construct one at startup and share it (it is `Sync`). Registering a call never
/// fails and never panics into the caller: problems are logged and the counters
/// involved are retried on a later flush.
pub struct CallStats {
    source: Arc<dyn ConnectionSource>,
    dimensions: Arc<Dimensions>,
    daily: DailyStats,
    hourly: HourlyStats,
}

impl CallStats {
    /// Open the database file named in `config`, creating its tables if configured to
    pub fn open(config: &StatsConfig) -> Result<Self, StartupError> {
        let source = SqliteFile::new(config.database_path()).busy_timeout(config.busy_timeout_duration());
        Self::with_source(config, Arc::new(source), TimeSource::System)
    }

    /// Write through an arbitrary connection source, reading the clock from `time_source`
    pub fn with_source(
        config: &StatsConfig,
        source: Arc<dyn ConnectionSource>,
        time_source: TimeSource,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let utc_offset = config.utc_offset()?;
        let resolver = Arc::new(TimeBucketResolver::new(utc_offset));
        if config.creates_schema() {
            let conn = source.connect()?;
            schema::create_tables(&conn)?;
        }

        let dimensions = Arc::new(Dimensions::new());
        let engine_config = config.engine_config();
        let interval = engine_config.interval();
        let daily = DailyStats {
            engine: WriteBackEngine::new(
                "daily",
                DailyWriter::new(source.clone(), dimensions.clone()),
                engine_config.clone(),
                time_source.clone(),
            ),
            resolver: resolver.clone(),
            time_source: time_source.clone(),
            source: source.clone(),
            dimensions: dimensions.clone(),
        };
        let hourly = HourlyStats {
            engine: WriteBackEngine::new(
                "hourly",
                HourlyWriter::new(source.clone(), dimensions.clone()),
                engine_config,
                time_source.clone(),
            ),
            resolver,
            time_source,
            source: source.clone(),
            dimensions: dimensions.clone(),
        };
        debug!(
            %utc_offset,
            ?interval,
            "call statistics collector ready"
        );

        Ok(Self {
            source,
            dimensions,
            daily,
            hourly,
        })
    }

    /// Per-customer daily counters
    pub fn daily(&self) -> &DailyStats {
        &self.daily
    }

    /// Per-layer hourly counters
    pub fn hourly(&self) -> &HourlyStats {
        &self.hourly
    }

    /// The dimension id caches shared by both families
    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    /// Write every cached counter to the database
    ///
    /// Meant for shutdown, after the last call has been registered. Failures are logged
    /// and reported in the summary; the affected counters stay cached.
    pub fn flush(&self) -> FlushSummary {
        FlushSummary {
            daily: drain(self.daily.engine.name(), || self.daily.engine.flush()),
            hourly: drain(self.hourly.engine.name(), || self.hourly.engine.flush()),
        }
    }

    /// Check the database answers a trivial query
    pub fn health_check(&self) -> Result<(), StoreError> {
        let conn = self.source.connect()?;
        ping(&conn)
    }
}

/// Outcome of [`CallStats::flush`] for each family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Daily rows written, or `None` if the drain was abandoned
    pub daily: Option<usize>,
    /// Hourly rows written, or `None` if the drain was abandoned
    pub hourly: Option<usize>,
}

impl FlushSummary {
    /// Whether both families were fully written
    pub fn is_complete(&self) -> bool {
        self.daily.is_some() && self.hourly.is_some()
    }
}

fn drain(family: &'static str, flush: impl FnOnce() -> Result<usize, PersistError>) -> Option<usize> {
    match panic::catch_unwind(AssertUnwindSafe(flush)) {
        Ok(Ok(rows)) => Some(rows),
        Ok(Err(err)) => {
            error!(family, error = %err, "final flush failed, counters remain cached");
            None
        }
        Err(_) => {
            error!(family, "final flush panicked");
            None
        }
    }
}

fn guard(family: &'static str, register: impl FnOnce() -> Result<(), InvalidCounters>) {
    match panic::catch_unwind(AssertUnwindSafe(register)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(family, error = %err, "call statistics rejected"),
        Err(_) => error!(family, "panicked while registering call statistics"),
    }
}

/// Daily counters, keyed by call site, customer and local date
pub struct DailyStats {
    engine: WriteBackEngine<DailyCounters, DailyWriter>,
    resolver: Arc<TimeBucketResolver>,
    time_source: TimeSource,
    source: Arc<dyn ConnectionSource>,
    dimensions: Arc<Dimensions>,
}

impl DailyStats {
    /// Count a successful call
    pub fn register_correct_call(&self, site: &CallSite, customer: Option<&str>) {
        self.register(site, customer, Outcome::Correct);
    }

    /// Count a call rejected as invalid
    pub fn register_invalid_call(&self, site: &CallSite, customer: Option<&str>) {
        self.register(site, customer, Outcome::Invalid);
    }

    /// Count a failed call
    pub fn register_failed_call(&self, site: &CallSite, customer: Option<&str>) {
        self.register(site, customer, Outcome::Failed);
    }

    /// Count one call with the given outcome
    pub fn register(&self, site: &CallSite, customer: Option<&str>, outcome: Outcome) {
        guard(self.engine.name(), || {
            let bucket = self.resolver.resolve(self.time_source.unix_millis());
            let key = DailyKey {
                site: site.clone(),
                customer: customer.map(str::to_owned),
                date: bucket.date,
            };
            self.engine.register(
                key,
                |key| DailyCounters::new(key.clone(), bucket.day_of_week),
                |counters| counters.record(outcome),
            )
        });
    }

    /// Read the stored row for `key`
    pub fn load(&self, key: &DailyKey) -> Result<Option<DailyRow>, StoreError> {
        let conn = self.source.connect()?;
        DailyRow::load(&conn, &self.dimensions, key)
    }

    /// The underlying engine
    #[cfg(feature = "test-util")]
    pub fn engine(&self) -> &WriteBackEngine<DailyCounters, DailyWriter> {
        &self.engine
    }
}

/// Hourly counters, keyed by call site, layer and local hour
pub struct HourlyStats {
    engine: WriteBackEngine<HourlyCounters, HourlyWriter>,
    resolver: Arc<TimeBucketResolver>,
    time_source: TimeSource,
    source: Arc<dyn ConnectionSource>,
    dimensions: Arc<Dimensions>,
}

impl HourlyStats {
    /// Count a successful call that took `elapsed`
    pub fn register_correct_call(&self, site: &CallSite, layer: Option<&str>, elapsed: Duration) {
        self.register(site, layer, Outcome::Correct, elapsed);
    }

    /// Count a call rejected as invalid after `elapsed`
    pub fn register_invalid_call(&self, site: &CallSite, layer: Option<&str>, elapsed: Duration) {
        self.register(site, layer, Outcome::Invalid, elapsed);
    }

    /// Count a call that failed after `elapsed`
    pub fn register_failed_call(&self, site: &CallSite, layer: Option<&str>, elapsed: Duration) {
        self.register(site, layer, Outcome::Failed, elapsed);
    }

    /// Count one call with the given outcome
    pub fn register(&self, site: &CallSite, layer: Option<&str>, outcome: Outcome, elapsed: Duration) {
        guard(self.engine.name(), || {
            let bucket = self.resolver.resolve(self.time_source.unix_millis());
            let key = HourlyKey {
                site: site.clone(),
                layer: layer.map(str::to_owned),
                hour: bucket.hour,
            };
            self.engine.register(
                key,
                |key| HourlyCounters::new(key.clone(), bucket.day_of_week, bucket.hour_of_day),
                |counters| counters.record(outcome, elapsed),
            )
        });
    }

    /// Start timing a call on this collector's clock
    pub fn timer(&self) -> CallTimer {
        CallTimer::start(self.time_source.clone())
    }

    /// Read the stored row for `key`
    pub fn load(&self, key: &HourlyKey) -> Result<Option<HourlyRow>, StoreError> {
        let conn = self.source.connect()?;
        HourlyRow::load(&conn, &self.dimensions, key)
    }

    /// The underlying engine
    #[cfg(feature = "test-util")]
    pub fn engine(&self) -> &WriteBackEngine<HourlyCounters, HourlyWriter> {
        &self.engine
    }
}
