// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-layer outcome counts, durations and latency histograms per hour

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use callstats_aggregation::{Counters, InvalidCounters, RowWriter, StoreError};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, ToSql};

use crate::{
    dimension::Dimensions,
    families::{CallSite, Outcome, SiteIds, latency_bucket},
    schema::{LATENCY_BUCKETS, PRODUCT_WIDTH},
    store::{ConnectionSource, store_error},
    text::pad_fixed,
};

/// Key of one hourly counter row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HourlyKey {
    /// Where the calls were made
    pub site: CallSite,
    /// Application layer that handled the calls
    pub layer: Option<String>,
    /// Local date and hour, truncated to the hour
    pub hour: NaiveDateTime,
}

/// Outcome counts, duration sums and latency histogram for one [`HourlyKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourlyCounters {
    key: HourlyKey,
    day_of_week: u8,
    hour_of_day: u8,
    /// Successful calls
    pub correct: i64,
    /// Rejected calls
    pub invalid: i64,
    /// Failed calls
    pub failed: i64,
    /// Total milliseconds spent in successful calls
    pub duration_correct: i64,
    /// Total milliseconds spent in rejected calls
    pub duration_invalid: i64,
    /// Total milliseconds spent in failed calls
    pub duration_failed: i64,
    /// Calls per latency bucket, see [`crate::LATENCY_BOUNDS_MS`]
    pub buckets: [i64; LATENCY_BUCKETS],
}

impl HourlyCounters {
    /// Zeroed counters. `day_of_week` counts from Sunday and must be within `0..=6`;
    /// `hour_of_day` must be within `0..=23`.
    pub fn new(key: HourlyKey, day_of_week: u8, hour_of_day: u8) -> Result<Self, InvalidCounters> {
        Ok(Self {
            key,
            day_of_week: InvalidCounters::check_day_of_week(day_of_week)?,
            hour_of_day: InvalidCounters::check_hour_of_day(hour_of_day)?,
            correct: 0,
            invalid: 0,
            failed: 0,
            duration_correct: 0,
            duration_invalid: 0,
            duration_failed: 0,
            buckets: [0; LATENCY_BUCKETS],
        })
    }

    /// Day of week, counted from Sunday
    pub fn day_of_week(&self) -> u8 {
        self.day_of_week
    }

    /// Local hour
    pub fn hour_of_day(&self) -> u8 {
        self.hour_of_day
    }

    /// Count one call that took `elapsed`
    pub fn record(&mut self, outcome: Outcome, elapsed: Duration) {
        let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        let (count, duration) = match outcome {
            Outcome::Correct => (&mut self.correct, &mut self.duration_correct),
            Outcome::Invalid => (&mut self.invalid, &mut self.duration_invalid),
            Outcome::Failed => (&mut self.failed, &mut self.duration_failed),
        };
        *count += 1;
        *duration = duration.saturating_add(millis);
        self.buckets[latency_bucket(elapsed)] += 1;
    }

    fn values(&self) -> impl Iterator<Item = &i64> {
        [
            &self.correct,
            &self.invalid,
            &self.failed,
            &self.duration_correct,
            &self.duration_invalid,
            &self.duration_failed,
        ]
        .into_iter()
        .chain(self.buckets.iter())
    }
}

impl Counters for HourlyCounters {
    type Key = HourlyKey;

    fn key(&self) -> &HourlyKey {
        &self.key
    }

    fn subtract(&mut self, persisted: &Self) -> bool {
        self.correct -= persisted.correct;
        self.invalid -= persisted.invalid;
        self.failed -= persisted.failed;
        self.duration_correct -= persisted.duration_correct;
        self.duration_invalid -= persisted.duration_invalid;
        self.duration_failed -= persisted.duration_failed;
        for (live, persisted) in self.buckets.iter_mut().zip(persisted.buckets) {
            *live -= persisted;
        }
        self.is_zero()
    }

    fn is_zero(&self) -> bool {
        self.values().all(|value| *value == 0)
    }

    fn zeroed(&self) -> Self {
        Self {
            key: self.key.clone(),
            day_of_week: self.day_of_week,
            hour_of_day: self.hour_of_day,
            correct: 0,
            invalid: 0,
            failed: 0,
            duration_correct: 0,
            duration_invalid: 0,
            duration_failed: 0,
            buckets: [0; LATENCY_BUCKETS],
        }
    }
}

const KEY_PREDICATE: &str = "method_id = ? AND origin_id = ? AND media_id = ? AND layer_id = ? \
    AND product = ? AND stat_hour = ?";

fn value_columns() -> impl Iterator<Item = String> {
    [
        "correct",
        "invalid",
        "failed",
        "duration_correct",
        "duration_invalid",
        "duration_failed",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain((0..LATENCY_BUCKETS).map(|i| format!("bucket_{i:02}")))
}

static UPDATE: LazyLock<String> = LazyLock::new(|| {
    let assignments = value_columns()
        .map(|column| format!("{column} = {column} + ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE stat_hourly SET {assignments} WHERE {KEY_PREDICATE}")
});

static INSERT: LazyLock<String> = LazyLock::new(|| {
    let columns = [
        "method_id",
        "origin_id",
        "media_id",
        "layer_id",
        "product",
        "stat_hour",
        "day_of_week",
        "hour_of_day",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain(value_columns())
    .collect::<Vec<_>>();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO stat_hourly ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
});

static SELECT: LazyLock<String> = LazyLock::new(|| {
    let columns = ["day_of_week".to_owned(), "hour_of_day".to_owned()]
        .into_iter()
        .chain(value_columns())
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM stat_hourly WHERE {KEY_PREDICATE}")
});

/// Key column values of one hourly row, in [`KEY_PREDICATE`] order
struct RowKey {
    ids: SiteIds,
    layer: i64,
    product: String,
    hour: NaiveDateTime,
}

impl RowKey {
    fn params(&self) -> [&dyn ToSql; 6] {
        [
            &self.ids.method,
            &self.ids.origin,
            &self.ids.media,
            &self.layer,
            &self.product,
            &self.hour,
        ]
    }
}

/// Writes [`HourlyCounters`] to `stat_hourly`
pub struct HourlyWriter {
    source: Arc<dyn ConnectionSource>,
    dimensions: Arc<Dimensions>,
}

impl HourlyWriter {
    /// Write through connections from `source`, resolving call sites with `dimensions`
    pub fn new(source: Arc<dyn ConnectionSource>, dimensions: Arc<Dimensions>) -> Self {
        Self { source, dimensions }
    }

    fn row_key(&self, conn: &Connection, key: &HourlyKey) -> Result<RowKey, StoreError> {
        Ok(RowKey {
            ids: SiteIds::resolve(&self.dimensions, conn, &key.site)?,
            layer: self.dimensions.layer().resolve(conn, &[key.layer.as_deref()])?,
            product: pad_fixed(key.site.product.as_deref(), PRODUCT_WIDTH),
            hour: key.hour,
        })
    }
}

impl RowWriter<HourlyCounters> for HourlyWriter {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, StoreError> {
        self.source.connect()
    }

    fn update(&self, conn: &mut Connection, delta: &HourlyCounters) -> Result<usize, StoreError> {
        let key = self.row_key(conn, &delta.key)?;
        let params = delta
            .values()
            .map(|value| value as &dyn ToSql)
            .chain(key.params())
            .collect::<Vec<_>>();
        let mut stmt = conn.prepare_cached(&UPDATE).map_err(store_error)?;
        stmt.execute(params.as_slice()).map_err(store_error)
    }

    fn insert(&self, conn: &mut Connection, delta: &HourlyCounters) -> Result<(), StoreError> {
        let key = self.row_key(conn, &delta.key)?;
        let params = key
            .params()
            .into_iter()
            .chain([&delta.day_of_week as &dyn ToSql, &delta.hour_of_day as &dyn ToSql])
            .chain(delta.values().map(|value| value as &dyn ToSql))
            .collect::<Vec<_>>();
        let mut stmt = conn.prepare_cached(&INSERT).map_err(store_error)?;
        stmt.execute(params.as_slice()).map_err(store_error)?;
        Ok(())
    }
}

/// The value columns of one `stat_hourly` row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyRow {
    /// Day of week, counted from Sunday
    pub day_of_week: u8,
    /// Local hour
    pub hour_of_day: u8,
    /// Successful calls
    pub correct: i64,
    /// Rejected calls
    pub invalid: i64,
    /// Failed calls
    pub failed: i64,
    /// Total milliseconds spent in successful calls
    pub duration_correct: i64,
    /// Total milliseconds spent in rejected calls
    pub duration_invalid: i64,
    /// Total milliseconds spent in failed calls
    pub duration_failed: i64,
    /// Calls per latency bucket
    pub buckets: [i64; LATENCY_BUCKETS],
}

impl HourlyRow {
    /// Read the stored row for `key`, if there is one
    pub fn load(
        conn: &Connection,
        dimensions: &Dimensions,
        key: &HourlyKey,
    ) -> Result<Option<Self>, StoreError> {
        let Some(ids) = SiteIds::lookup(dimensions, conn, &key.site)? else {
            return Ok(None);
        };
        let Some(layer) = dimensions.layer().lookup(conn, &[key.layer.as_deref()])? else {
            return Ok(None);
        };
        let row_key = RowKey {
            ids,
            layer,
            product: pad_fixed(key.site.product.as_deref(), PRODUCT_WIDTH),
            hour: key.hour,
        };

        conn.query_row(&SELECT, row_key.params().as_slice(), |row| {
            let mut buckets = [0; LATENCY_BUCKETS];
            for (i, bucket) in buckets.iter_mut().enumerate() {
                *bucket = row.get(8 + i)?;
            }
            Ok(Self {
                day_of_week: row.get(0)?,
                hour_of_day: row.get(1)?,
                correct: row.get(2)?,
                invalid: row.get(3)?,
                failed: row.get(4)?,
                duration_correct: row.get(5)?,
                duration_invalid: row.get(6)?,
                duration_failed: row.get(7)?,
                buckets,
            })
        })
        .optional()
        .map_err(store_error)
    }
}

impl From<&HourlyCounters> for HourlyRow {
    fn from(counters: &HourlyCounters) -> Self {
        Self {
            day_of_week: counters.day_of_week,
            hour_of_day: counters.hour_of_day,
            correct: counters.correct,
            invalid: counters.invalid,
            failed: counters.failed,
            duration_correct: counters.duration_correct,
            duration_invalid: counters.duration_invalid,
            duration_failed: counters.duration_failed,
            buckets: counters.buckets,
        }
    }
}
