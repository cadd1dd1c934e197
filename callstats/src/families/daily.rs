// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-customer outcome counts per calendar day

use std::sync::Arc;

use callstats_aggregation::{Counters, InvalidCounters, RowWriter, StoreError};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    dimension::Dimensions,
    families::{CallSite, Outcome, SiteIds},
    schema::{CUSTOMER_WIDTH, PRODUCT_WIDTH},
    store::{ConnectionSource, store_error},
    text::pad_fixed,
};

/// Key of one daily counter row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyKey {
    /// Where the calls were made
    pub site: CallSite,
    /// Customer the calls were made for
    pub customer: Option<String>,
    /// Local calendar date
    pub date: NaiveDate,
}

/// Outcome counts for one [`DailyKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCounters {
    key: DailyKey,
    day_of_week: u8,
    /// Successful calls
    pub correct: i64,
    /// Rejected calls
    pub invalid: i64,
    /// Failed calls
    pub failed: i64,
}

impl DailyCounters {
    /// Zeroed counters. `day_of_week` counts from Sunday and must be within `0..=6`.
    pub fn new(key: DailyKey, day_of_week: u8) -> Result<Self, InvalidCounters> {
        Ok(Self {
            key,
            day_of_week: InvalidCounters::check_day_of_week(day_of_week)?,
            correct: 0,
            invalid: 0,
            failed: 0,
        })
    }

    /// Day of week, counted from Sunday
    pub fn day_of_week(&self) -> u8 {
        self.day_of_week
    }

    /// Count one call
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Correct => self.correct += 1,
            Outcome::Invalid => self.invalid += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

impl Counters for DailyCounters {
    type Key = DailyKey;

    fn key(&self) -> &DailyKey {
        &self.key
    }

    fn subtract(&mut self, persisted: &Self) -> bool {
        self.correct -= persisted.correct;
        self.invalid -= persisted.invalid;
        self.failed -= persisted.failed;
        self.is_zero()
    }

    fn is_zero(&self) -> bool {
        self.correct == 0 && self.invalid == 0 && self.failed == 0
    }

    fn zeroed(&self) -> Self {
        Self {
            key: self.key.clone(),
            day_of_week: self.day_of_week,
            correct: 0,
            invalid: 0,
            failed: 0,
        }
    }
}

const UPDATE: &str = "UPDATE stat_daily
    SET correct = correct + ?1, invalid = invalid + ?2, failed = failed + ?3
    WHERE method_id = ?4 AND origin_id = ?5 AND media_id = ?6
      AND product = ?7 AND customer = ?8 AND stat_date = ?9";

const INSERT: &str = "INSERT INTO stat_daily
    (method_id, origin_id, media_id, product, customer, stat_date, day_of_week, correct, invalid, failed)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const SELECT: &str = "SELECT day_of_week, correct, invalid, failed FROM stat_daily
    WHERE method_id = ?1 AND origin_id = ?2 AND media_id = ?3
      AND product = ?4 AND customer = ?5 AND stat_date = ?6";

/// Writes [`DailyCounters`] to `stat_daily`
pub struct DailyWriter {
    source: Arc<dyn ConnectionSource>,
    dimensions: Arc<Dimensions>,
}

impl DailyWriter {
    /// Write through connections from `source`, resolving call sites with `dimensions`
    pub fn new(source: Arc<dyn ConnectionSource>, dimensions: Arc<Dimensions>) -> Self {
        Self { source, dimensions }
    }
}

impl RowWriter<DailyCounters> for DailyWriter {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, StoreError> {
        self.source.connect()
    }

    fn update(&self, conn: &mut Connection, delta: &DailyCounters) -> Result<usize, StoreError> {
        let ids = SiteIds::resolve(&self.dimensions, conn, &delta.key.site)?;
        let mut stmt = conn.prepare_cached(UPDATE).map_err(store_error)?;
        stmt.execute(params![
            delta.correct,
            delta.invalid,
            delta.failed,
            ids.method,
            ids.origin,
            ids.media,
            pad_fixed(delta.key.site.product.as_deref(), PRODUCT_WIDTH),
            pad_fixed(delta.key.customer.as_deref(), CUSTOMER_WIDTH),
            delta.key.date,
        ])
        .map_err(store_error)
    }

    fn insert(&self, conn: &mut Connection, delta: &DailyCounters) -> Result<(), StoreError> {
        let ids = SiteIds::resolve(&self.dimensions, conn, &delta.key.site)?;
        let mut stmt = conn.prepare_cached(INSERT).map_err(store_error)?;
        stmt.execute(params![
            ids.method,
            ids.origin,
            ids.media,
            pad_fixed(delta.key.site.product.as_deref(), PRODUCT_WIDTH),
            pad_fixed(delta.key.customer.as_deref(), CUSTOMER_WIDTH),
            delta.key.date,
            delta.day_of_week,
            delta.correct,
            delta.invalid,
            delta.failed,
        ])
        .map_err(store_error)?;
        Ok(())
    }
}

/// The value columns of one `stat_daily` row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyRow {
    /// Day of week, counted from Sunday
    pub day_of_week: u8,
    /// Successful calls
    pub correct: i64,
    /// Rejected calls
    pub invalid: i64,
    /// Failed calls
    pub failed: i64,
}

impl DailyRow {
    /// Read the stored row for `key`, if there is one
    pub fn load(
        conn: &Connection,
        dimensions: &Dimensions,
        key: &DailyKey,
    ) -> Result<Option<Self>, StoreError> {
        let Some(ids) = SiteIds::lookup(dimensions, conn, &key.site)? else {
            return Ok(None);
        };
        conn.query_row(
            SELECT,
            params![
                ids.method,
                ids.origin,
                ids.media,
                pad_fixed(key.site.product.as_deref(), PRODUCT_WIDTH),
                pad_fixed(key.customer.as_deref(), CUSTOMER_WIDTH),
                key.date,
            ],
            |row| {
                Ok(Self {
                    day_of_week: row.get(0)?,
                    correct: row.get(1)?,
                    invalid: row.get(2)?,
                    failed: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(store_error)
    }
}

impl From<&DailyCounters> for DailyRow {
    fn from(counters: &DailyCounters) -> Self {
        Self {
            day_of_week: counters.day_of_week,
            correct: counters.correct,
            invalid: counters.invalid,
            failed: counters.failed,
        }
    }
}
