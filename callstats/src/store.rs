// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! SQLite connections and error classification

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use callstats_aggregation::StoreError;
use rusqlite::{Connection, ErrorCode, ffi};

/// Hands out connections to the statistics database
///
/// One connection is requested per persist batch and dropped when the batch ends.
pub trait ConnectionSource: Send + Sync {
    /// Open or borrow a connection
    fn connect(&self) -> Result<Connection, StoreError>;
}

/// Opens a fresh connection to a database file for every batch
#[derive(Debug, Clone)]
pub struct SqliteFile {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteFile {
    /// Connect to the database at `path`, waiting up to five seconds on locks
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// How long a statement waits for another connection's lock before failing
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// The database file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionSource for SqliteFile {
    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(store_error)?;
        conn.busy_timeout(self.busy_timeout).map_err(store_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get::<_, String>(0))
            .map_err(store_error)?;
        Ok(conn)
    }
}

/// Classify a SQLite error, separating uniqueness violations from everything else
pub fn store_error(err: rusqlite::Error) -> StoreError {
    let unique = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    );
    if unique {
        StoreError::unique_violation(err)
    } else {
        StoreError::backend(err)
    }
}

/// Run a trivial round-trip query
pub fn ping(conn: &Connection) -> Result<(), StoreError> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(store_error)
}
