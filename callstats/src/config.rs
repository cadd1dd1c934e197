// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collector settings

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use callstats_aggregation::EngineConfig;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MINUTES_PER_DAY: i32 = 24 * 60;

/// Settings for [`crate::CallStats`]
///
/// Every field has a default, so a TOML file only needs the settings it changes:
///
/// ```
/// use callstats::StatsConfig;
///
/// let config = StatsConfig::from_toml_str(r#"
///     database = "/var/lib/service/stats.db"
///     flush_interval_secs = 30
///     utc_offset_minutes = 60
/// "#).unwrap();
/// assert_eq!(config.engine_config().batch_size(), 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsConfig {
    database: PathBuf,
    flush_interval_secs: u64,
    max_batch_size: usize,
    utc_offset_minutes: i32,
    busy_timeout_ms: u64,
    create_schema: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("callstats.db"),
            flush_interval_secs: 60,
            max_batch_size: 100,
            utc_offset_minutes: 0,
            busy_timeout_ms: 5000,
            create_schema: true,
        }
    }
}

impl StatsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Check every setting is in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("flush_interval_secs must be positive".into()));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be positive".into()));
        }
        if self.utc_offset_minutes.abs() >= MINUTES_PER_DAY {
            return Err(ConfigError::Invalid(format!(
                "utc_offset_minutes {} is not within a day of UTC",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    /// Database file to write to
    pub fn database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = path.into();
        self
    }

    /// Time between persistence passes, and the backoff after a failed one. Whole seconds.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_secs = interval.as_secs();
        self
    }

    /// Rows written per opportunistic flush
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Offset from UTC that calendar days and hours are counted in
    pub fn utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// How long a statement waits on another process's lock
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Whether to create missing tables at startup
    pub fn create_schema(mut self, create: bool) -> Self {
        self.create_schema = create;
        self
    }

    /// The database file
    pub fn database_path(&self) -> &Path {
        &self.database
    }

    /// The configured lock wait
    pub fn busy_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Whether missing tables are created at startup
    pub fn creates_schema(&self) -> bool {
        self.create_schema
    }

    /// Flush pacing for both engines. Call [`StatsConfig::validate`] first.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .flush_interval(Duration::from_secs(self.flush_interval_secs.max(1)))
            .max_batch_size(self.max_batch_size.max(1))
    }

    /// The offset calendar fields are computed in
    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "utc_offset_minutes {} is not within a day of UTC",
                    self.utc_offset_minutes
                ))
            })
    }
}
