// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Surrogate ids for business keys
//!
//! Counter rows reference call sites through small integer ids handed out by lookup
//! tables. Every process in a cluster resolves the same business key to the same id:
//! the first one to need it inserts the row, and anyone losing the race re-reads the
//! winner's id after the `UNIQUE` constraint rejects their insert.

use std::sync::{Mutex, MutexGuard, PoisonError};

use callstats_aggregation::StoreError;
use hashbrown::HashMap;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use smallvec::SmallVec;
use tracing::debug;

use crate::{
    schema::{NAME_WIDTH, SHORT_NAME_WIDTH},
    store::store_error,
    text::normalize,
};

/// A normalized business key, one string per key column
pub type DimensionKey = SmallVec<[String; 2]>;

/// A lookup table mapping a business key to an autoincrement id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionTable {
    /// Table name
    pub name: &'static str,
    /// Key columns with their widths
    pub columns: &'static [(&'static str, usize)],
}

impl DimensionTable {
    /// `(service, method)` pairs
    pub const METHOD: Self = Self {
        name: "stat_dim_method",
        columns: &[("service", NAME_WIDTH), ("method", NAME_WIDTH)],
    };
    /// Where calls come from
    pub const ORIGIN: Self = Self {
        name: "stat_dim_origin",
        columns: &[("name", NAME_WIDTH)],
    };
    /// Delivery channel
    pub const MEDIA: Self = Self {
        name: "stat_dim_media",
        columns: &[("name", SHORT_NAME_WIDTH)],
    };
    /// Application layer, hourly counters only
    pub const LAYER: Self = Self {
        name: "stat_dim_layer",
        columns: &[("name", SHORT_NAME_WIDTH)],
    };

    /// Normalize raw values into this table's key. Missing trailing values count as absent.
    pub fn key(&self, raw: &[Option<&str>]) -> DimensionKey {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, (_, width))| normalize(raw.get(i).copied().flatten(), *width))
            .collect()
    }

    fn select_sql(&self) -> String {
        let predicate = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!("SELECT id FROM {} WHERE {predicate}", self.name)
    }

    fn insert_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|(column, _)| *column)
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({columns}) VALUES ({placeholders})", self.name)
    }
}

/// In-memory cache over one [`DimensionTable`]
///
/// Entries are never invalidated by other processes; ids are stable once assigned, so
/// the only reason to [`clear`](Self::clear) is an operator deleting rows by hand.
#[derive(Debug)]
pub struct DimensionCache {
    table: DimensionTable,
    select_sql: String,
    insert_sql: String,
    ids: Mutex<HashMap<DimensionKey, i64>>,
}

impl DimensionCache {
    /// Create an empty cache over `table`
    pub fn new(table: DimensionTable) -> Self {
        Self {
            table,
            select_sql: table.select_sql(),
            insert_sql: table.insert_sql(),
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a business key to its id, creating the row if no process has yet
    pub fn resolve(&self, conn: &Connection, raw: &[Option<&str>]) -> Result<i64, StoreError> {
        let key = self.table.key(raw);
        if let Some(id) = self.lock().get(&key) {
            return Ok(*id);
        }

        let id = match self.select(conn, &key)? {
            Some(id) => id,
            None => self.insert_or_refetch(conn, &key)?,
        };
        self.remember(key, id);
        Ok(id)
    }

    /// Look a business key up without creating it
    pub fn lookup(&self, conn: &Connection, raw: &[Option<&str>]) -> Result<Option<i64>, StoreError> {
        let key = self.table.key(raw);
        if let Some(id) = self.lock().get(&key) {
            return Ok(Some(*id));
        }

        let found = self.select(conn, &key)?;
        if let Some(id) = found {
            self.remember(key, id);
        }
        Ok(found)
    }

    /// Insert the key unconditionally, without falling back to a lookup
    ///
    /// Fails with a uniqueness violation if the row already exists.
    pub fn insert_raw(&self, conn: &Connection, raw: &[Option<&str>]) -> Result<i64, StoreError> {
        let key = self.table.key(raw);
        let id = self.insert(conn, &key)?;
        self.remember(key, id);
        Ok(id)
    }

    /// Forget every cached id. The table itself is untouched.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of cached ids
    pub fn cached_len(&self) -> usize {
        self.lock().len()
    }

    fn insert_or_refetch(&self, conn: &Connection, key: &DimensionKey) -> Result<i64, StoreError> {
        match self.insert(conn, key) {
            Ok(id) => Ok(id),
            Err(err) if err.is_unique_violation() => {
                debug!(table = self.table.name, ?key, "dimension created concurrently, reading it back");
                self.select(conn, key)?.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    fn select(&self, conn: &Connection, key: &DimensionKey) -> Result<Option<i64>, StoreError> {
        let mut stmt = conn.prepare_cached(&self.select_sql).map_err(store_error)?;
        stmt.query_row(params_from_iter(key.iter()), |row| row.get(0))
            .optional()
            .map_err(store_error)
    }

    fn insert(&self, conn: &Connection, key: &DimensionKey) -> Result<i64, StoreError> {
        let mut stmt = conn.prepare_cached(&self.insert_sql).map_err(store_error)?;
        stmt.execute(params_from_iter(key.iter()))
            .map_err(store_error)?;
        Ok(conn.last_insert_rowid())
    }

    fn remember(&self, key: DimensionKey, id: i64) {
        self.lock().insert(key, id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DimensionKey, i64>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The four dimension caches used by the counter families
#[derive(Debug)]
pub struct Dimensions {
    method: DimensionCache,
    origin: DimensionCache,
    media: DimensionCache,
    layer: DimensionCache,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new()
    }
}

impl Dimensions {
    /// Empty caches over the standard tables
    pub fn new() -> Self {
        Self {
            method: DimensionCache::new(DimensionTable::METHOD),
            origin: DimensionCache::new(DimensionTable::ORIGIN),
            media: DimensionCache::new(DimensionTable::MEDIA),
            layer: DimensionCache::new(DimensionTable::LAYER),
        }
    }

    /// `(service, method)` ids
    pub fn method(&self) -> &DimensionCache {
        &self.method
    }

    /// Origin ids
    pub fn origin(&self) -> &DimensionCache {
        &self.origin
    }

    /// Media ids
    pub fn media(&self) -> &DimensionCache {
        &self.media
    }

    /// Layer ids
    pub fn layer(&self) -> &DimensionCache {
        &self.layer
    }

    /// Forget every cached id in all four caches
    pub fn clear(&self) {
        self.method.clear();
        self.origin.clear();
        self.media.clear();
        self.layer.clear();
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use rusqlite::Connection;

    use super::{DimensionCache, DimensionTable};
    use crate::schema::create_tables;

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn statements_follow_the_key_columns() {
        check!(
            DimensionTable::METHOD.select_sql()
                == "SELECT id FROM stat_dim_method WHERE service = ?1 AND method = ?2"
        );
        check!(
            DimensionTable::LAYER.insert_sql() == "INSERT INTO stat_dim_layer (name) VALUES (?1)"
        );
    }

    #[test]
    fn missing_values_share_the_placeholder() {
        check!(DimensionTable::METHOD.key(&[Some("catalog")]).as_slice() == ["catalog", "-"]);
        check!(DimensionTable::ORIGIN.key(&[Some("  ")]) == DimensionTable::ORIGIN.key(&[None]));
    }

    #[test]
    fn refetches_after_losing_the_insert_race() {
        let conn = connection();
        let winner = DimensionCache::new(DimensionTable::ORIGIN);
        let loser = DimensionCache::new(DimensionTable::ORIGIN);

        let id = winner.insert_raw(&conn, &[Some("web")]).unwrap();
        let key = DimensionTable::ORIGIN.key(&[Some("web")]);
        check!(loser.insert_or_refetch(&conn, &key).unwrap() == id);
    }

    #[test]
    fn insert_raw_does_not_fall_back() {
        let conn = connection();
        let cache = DimensionCache::new(DimensionTable::MEDIA);
        cache.insert_raw(&conn, &[Some("sms")]).unwrap();
        cache.clear();

        let_assert!(Err(err) = cache.insert_raw(&conn, &[Some("sms")]));
        check!(err.is_unique_violation());
        check!(cache.cached_len() == 0);
    }

    #[test]
    fn resolution_is_cached() {
        let conn = connection();
        let cache = DimensionCache::new(DimensionTable::METHOD);
        let id = cache.resolve(&conn, &[Some("catalog"), Some("getBook")]).unwrap();
        conn.execute("DELETE FROM stat_dim_method", []).unwrap();

        check!(cache.resolve(&conn, &[Some(" catalog "), Some("getBook")]).unwrap() == id);
        check!(cache.cached_len() == 1);
    }
}
