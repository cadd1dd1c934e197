// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Table layout shared by every process writing statistics
//!
//! All processes in a cluster must agree on these tables: counter rows are located by
//! their full key, and the dimension tables hand out ids through their `UNIQUE`
//! constraints. [`create_tables`] is idempotent and safe to run from every process at
//! startup.

use callstats_aggregation::StoreError;
use rusqlite::Connection;

use crate::store::store_error;

/// Width of the padded `product` key column
pub const PRODUCT_WIDTH: usize = 8;
/// Width of the padded `customer` key column
pub const CUSTOMER_WIDTH: usize = 16;
/// Width of service, method and origin names
pub const NAME_WIDTH: usize = 64;
/// Width of media and layer names
pub const SHORT_NAME_WIDTH: usize = 32;
/// Number of latency histogram columns in `stat_hourly`
pub const LATENCY_BUCKETS: usize = 12;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS stat_dim_method (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    service VARCHAR(64) NOT NULL,
    method  VARCHAR(64) NOT NULL,
    UNIQUE (service, method)
);

CREATE TABLE IF NOT EXISTS stat_dim_origin (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name VARCHAR(64) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS stat_dim_media (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name VARCHAR(32) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS stat_dim_layer (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name VARCHAR(32) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS stat_daily (
    method_id   INTEGER NOT NULL REFERENCES stat_dim_method (id),
    origin_id   INTEGER NOT NULL REFERENCES stat_dim_origin (id),
    media_id    INTEGER NOT NULL REFERENCES stat_dim_media (id),
    product     CHAR(8) NOT NULL,
    customer    CHAR(16) NOT NULL,
    stat_date   DATE NOT NULL,
    day_of_week INTEGER NOT NULL,
    correct     INTEGER NOT NULL DEFAULT 0,
    invalid     INTEGER NOT NULL DEFAULT 0,
    failed      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (method_id, origin_id, media_id, product, customer, stat_date)
);

CREATE TABLE IF NOT EXISTS stat_hourly (
    method_id        INTEGER NOT NULL REFERENCES stat_dim_method (id),
    origin_id        INTEGER NOT NULL REFERENCES stat_dim_origin (id),
    media_id         INTEGER NOT NULL REFERENCES stat_dim_media (id),
    layer_id         INTEGER NOT NULL REFERENCES stat_dim_layer (id),
    product          CHAR(8) NOT NULL,
    stat_hour        DATETIME NOT NULL,
    day_of_week      INTEGER NOT NULL,
    hour_of_day      INTEGER NOT NULL,
    correct          INTEGER NOT NULL DEFAULT 0,
    invalid          INTEGER NOT NULL DEFAULT 0,
    failed           INTEGER NOT NULL DEFAULT 0,
    duration_correct INTEGER NOT NULL DEFAULT 0,
    duration_invalid INTEGER NOT NULL DEFAULT 0,
    duration_failed  INTEGER NOT NULL DEFAULT 0,
    bucket_00        INTEGER NOT NULL DEFAULT 0,
    bucket_01        INTEGER NOT NULL DEFAULT 0,
    bucket_02        INTEGER NOT NULL DEFAULT 0,
    bucket_03        INTEGER NOT NULL DEFAULT 0,
    bucket_04        INTEGER NOT NULL DEFAULT 0,
    bucket_05        INTEGER NOT NULL DEFAULT 0,
    bucket_06        INTEGER NOT NULL DEFAULT 0,
    bucket_07        INTEGER NOT NULL DEFAULT 0,
    bucket_08        INTEGER NOT NULL DEFAULT 0,
    bucket_09        INTEGER NOT NULL DEFAULT 0,
    bucket_10        INTEGER NOT NULL DEFAULT 0,
    bucket_11        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (method_id, origin_id, media_id, layer_id, product, stat_hour)
);
";

/// Create every statistics table that does not exist yet
pub fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(DDL).map_err(store_error)
}
