// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Traits the engine is generic over
//!
//! A counter family plugs into [`crate::WriteBackEngine`] with two pieces:
//!
//! - a [`Counters`] type, the mutable value kept per key, which knows its own key and
//!   how to subtract a persisted snapshot from itself
//! - a [`RowWriter`], which turns one snapshot into storage statements
//!
//! The engine owns everything in between: locking, snapshotting, batching, the
//! update/insert/update protocol and failure backoff.

use std::{fmt::Debug, hash::Hash, ops::Deref};

use crate::error::StoreError;

/// A set of counters aggregated under one key
///
/// `subtract` must be exact: subtracting a clone of `self` from `self` leaves every
/// field at zero and returns `true`.
pub trait Counters: Clone + Send + 'static {
    /// The aggregation key. Immutable once constructed.
    type Key: Clone + Eq + Hash + Debug + Send + 'static;

    /// The key these counters are aggregated under
    fn key(&self) -> &Self::Key;

    /// Subtract `persisted` field by field, returning `true` if every field is now zero
    ///
    /// Fields may go negative when the same amount was persisted twice. The negative
    /// amount is then written on the next cycle, correcting the stored row.
    fn subtract(&mut self, persisted: &Self) -> bool;

    /// Whether every counted field is zero
    fn is_zero(&self) -> bool;

    /// Counters with the same key and fixed attributes but every counted field zero
    fn zeroed(&self) -> Self;
}

/// A point-in-time copy of live counters, taken for persistence
///
/// Snapshots are read-only. The engine never puts one back into its live cache.
#[derive(Debug, Clone)]
pub struct Snapshot<C>(C);

impl<C: Counters> Snapshot<C> {
    pub(crate) fn capture(live: &C) -> Self {
        Self(live.clone())
    }

    /// The key of the captured counters
    pub fn key(&self) -> &C::Key {
        self.0.key()
    }
}

impl<C> Deref for Snapshot<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.0
    }
}

/// Family-specific storage hooks
///
/// The engine acquires one connection per batch with [`RowWriter::connect`] and drops it
/// when the batch ends. Implementations must report uniqueness violations on insert as
/// [`StoreError::UniqueViolation`]; every other failure is treated as transient.
pub trait RowWriter<C: Counters>: Send + Sync {
    /// Connection handle used for the duration of one batch
    type Connection;

    /// Acquire a connection for one batch
    fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Add `delta` to the existing row for its key, returning the number of rows affected
    fn update(&self, conn: &mut Self::Connection, delta: &C) -> Result<usize, StoreError>;

    /// Create the row for `delta`'s key, seeded with `delta`
    fn insert(&self, conn: &mut Self::Connection, delta: &C) -> Result<(), StoreError>;
}
