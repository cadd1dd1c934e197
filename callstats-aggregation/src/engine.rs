// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The aggregation cache and its write-back loop

use std::sync::{Mutex, MutexGuard, PoisonError};

use callstats_timesource::TimeSource;
use hashbrown::{HashMap, hash_map::Entry};
use tracing::{debug, error, warn};

use crate::{
    config::EngineConfig,
    error::{InvalidCounters, PersistError},
    traits::{Counters, RowWriter, Snapshot},
};

struct EngineState<C: Counters> {
    live: HashMap<C::Key, C>,
    pending: Vec<Snapshot<C>>,
    next_flush_due: i64,
}

/// Key-to-counter cache that persists itself from caller threads
///
/// All state (the live cache, the list of snapshots awaiting persistence and the next
/// flush deadline) sits behind one mutex. The mutex is only held for in-memory work;
/// storage calls happen with it released, so a slow store stalls the thread currently
/// writing a batch but never the increment path.
///
/// # Example
///
/// ```
/// use callstats_aggregation::{
///     Counters, EngineConfig, InvalidCounters, RowWriter, StoreError, WriteBackEngine,
/// };
/// use callstats_timesource::TimeSource;
///
/// #[derive(Clone)]
/// struct Hits {
///     endpoint: String,
///     count: i64,
/// }
///
/// impl Counters for Hits {
///     type Key = String;
///     fn key(&self) -> &String { &self.endpoint }
///     fn subtract(&mut self, persisted: &Self) -> bool {
///         self.count -= persisted.count;
///         self.is_zero()
///     }
///     fn is_zero(&self) -> bool { self.count == 0 }
///     fn zeroed(&self) -> Self { Hits { endpoint: self.endpoint.clone(), count: 0 } }
/// }
///
/// struct Discard;
///
/// impl RowWriter<Hits> for Discard {
///     type Connection = ();
///     fn connect(&self) -> Result<(), StoreError> { Ok(()) }
///     fn update(&self, _: &mut (), _: &Hits) -> Result<usize, StoreError> { Ok(1) }
///     fn insert(&self, _: &mut (), _: &Hits) -> Result<(), StoreError> { Ok(()) }
/// }
///
/// let engine = WriteBackEngine::new("hits", Discard, EngineConfig::new(), TimeSource::System);
/// engine
///     .register(
///         "/books".to_string(),
///         |key| Ok::<_, InvalidCounters>(Hits { endpoint: key.clone(), count: 0 }),
///         |hits| hits.count += 1,
///     )
///     .unwrap();
/// assert_eq!(engine.flush().unwrap(), 1);
/// ```
pub struct WriteBackEngine<C: Counters, W> {
    name: &'static str,
    writer: W,
    config: EngineConfig,
    time_source: TimeSource,
    state: Mutex<EngineState<C>>,
}

impl<C, W> WriteBackEngine<C, W>
where
    C: Counters,
    W: RowWriter<C>,
{
    /// Create an engine. The first opportunistic flush is due one interval from now.
    ///
    /// `name` identifies the counter family in log events.
    pub fn new(name: &'static str, writer: W, config: EngineConfig, time_source: TimeSource) -> Self {
        let next_flush_due = time_source.unix_millis().saturating_add(config.interval_millis());
        Self {
            name,
            writer,
            config,
            time_source,
            state: Mutex::new(EngineState {
                live: HashMap::new(),
                pending: Vec::new(),
                next_flush_due,
            }),
        }
    }

    /// The family name used in log events
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The storage hooks this engine writes through
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Apply an increment, then give the engine a chance to persist
    ///
    /// Persistence problems are logged and retried on a later cycle; they are never
    /// reported here. Only a rejected counter creation is.
    pub fn register<F, A>(&self, key: C::Key, create: F, apply: A) -> Result<(), InvalidCounters>
    where
        F: FnOnce(&C::Key) -> Result<C, InvalidCounters>,
        A: FnOnce(&mut C),
    {
        self.increment(key, create, apply)?;
        // failures are logged and backed off inside
        let _ = self.allow_store();
        Ok(())
    }

    /// Fetch or create the counters for `key` and apply `apply` to them, without persisting
    ///
    /// `create` is only called when the key has no live entry; if it fails nothing is
    /// inserted.
    pub fn increment<F, A>(&self, key: C::Key, create: F, apply: A) -> Result<(), InvalidCounters>
    where
        F: FnOnce(&C::Key) -> Result<C, InvalidCounters>,
        A: FnOnce(&mut C),
    {
        let mut state = self.lock();
        let counters = match state.live.entry(key) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let created = create(vacant.key())?;
                vacant.insert(created)
            }
        };
        apply(counters);
        Ok(())
    }

    /// Persist a bounded batch if the flush deadline has passed
    ///
    /// Before the deadline this is a lock and a comparison. Returns how many rows were
    /// written.
    pub fn allow_store(&self) -> Result<usize, PersistError> {
        let now = self.time_source.unix_millis();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if now < state.next_flush_due {
                return Ok(0);
            }
            if state.pending.is_empty() {
                state
                    .pending
                    .extend(state.live.values().map(Snapshot::capture));
                if state.pending.is_empty() {
                    state.next_flush_due = now.saturating_add(self.config.interval_millis());
                    return Ok(0);
                }
                debug!(
                    family = self.name,
                    pending = state.pending.len(),
                    "snapshotted live counters for persistence"
                );
            }
        }
        self.persist_batch()
    }

    /// Persist everything currently in the cache
    ///
    /// Meant for shutdown. Increments arriving while this runs are kept in the cache but
    /// may not be part of this drain, so callers should stop registering first.
    /// Returns the number of rows written, or the error that abandoned the drain.
    pub fn flush(&self) -> Result<usize, PersistError> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.pending.clear();
            state
                .pending
                .extend(state.live.values().map(Snapshot::capture));
            state.next_flush_due = self.next_deadline();
            debug!(
                family = self.name,
                pending = state.pending.len(),
                "draining live counters"
            );
        }

        let mut persisted = 0;
        loop {
            {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    break;
                }
                // keeps concurrent opportunistic flushes from joining in
                state.next_flush_due = self.next_deadline();
            }
            persisted += self.persist_batch()?;
        }
        Ok(persisted)
    }

    fn persist_batch(&self) -> Result<usize, PersistError> {
        let mut connection = None;
        let mut persisted = 0;

        while persisted < self.config.batch_size() {
            let Some(snapshot) = self.pop_pending() else {
                break;
            };

            let mut conn = match connection.take() {
                Some(conn) => conn,
                None => match self.writer.connect() {
                    Ok(conn) => conn,
                    Err(err) => return Err(self.abandon(PersistError::Connect(err))),
                },
            };
            let written = self.write_row(&mut conn, &snapshot);
            connection = Some(conn);

            match written {
                Ok(()) => {
                    self.reconcile(&snapshot);
                    persisted += 1;
                }
                Err(err) => return Err(self.abandon(err)),
            }
        }

        if persisted > 0 {
            debug!(family = self.name, persisted, "persisted batch");
        }
        Ok(persisted)
    }

    /// UPDATE, then INSERT, then UPDATE again if another writer created the row first
    fn write_row(&self, conn: &mut W::Connection, delta: &C) -> Result<(), PersistError> {
        match self.writer.update(conn, delta)? {
            1 => return Ok(()),
            0 => {}
            affected => {
                return Err(PersistError::UnexpectedRowCount {
                    statement: "update",
                    affected,
                });
            }
        }

        match self.writer.insert(conn, delta) {
            Ok(()) => Ok(()),
            Err(err) if err.is_unique_violation() => {
                debug!(family = self.name, key = ?delta.key(), "row created concurrently, retrying update");
                match self.writer.update(conn, delta)? {
                    1 => Ok(()),
                    affected => Err(PersistError::UnexpectedRowCount {
                        statement: "retried update",
                        affected,
                    }),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn pop_pending(&self) -> Option<Snapshot<C>> {
        let mut state = self.lock();
        let snapshot = state.pending.pop();
        if snapshot.is_some() && state.pending.is_empty() {
            state.next_flush_due = self.next_deadline();
        }
        snapshot
    }

    /// Take a persisted snapshot's amounts out of the live cache
    fn reconcile(&self, snapshot: &Snapshot<C>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let drained = match state.live.get_mut(snapshot.key()) {
            Some(live) => live.subtract(snapshot),
            None => {
                let mut materialized = snapshot.zeroed();
                let drained = materialized.subtract(snapshot);
                if !drained {
                    state.live.insert(snapshot.key().clone(), materialized);
                }
                drained
            }
        };
        if drained {
            state.live.remove(snapshot.key());
        }
    }

    fn abandon(&self, err: PersistError) -> PersistError {
        let dropped = {
            let mut state = self.lock();
            let dropped = state.pending.len();
            state.pending.clear();
            state.next_flush_due = self.next_deadline();
            dropped
        };
        if err.is_integrity_error() {
            error!(family = self.name, error = %err, dropped, "abandoned batch on unexpected row count");
        } else {
            warn!(family = self.name, error = %err, dropped, "abandoned batch, retrying after the flush interval");
        }
        err
    }

    fn next_deadline(&self) -> i64 {
        self.time_source
            .unix_millis()
            .saturating_add(self.config.interval_millis())
    }

    fn lock(&self) -> MutexGuard<'_, EngineState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of an engine's internal state
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Keys in the live cache
    pub live_entries: usize,
    /// Snapshots waiting to be persisted
    pub pending_entries: usize,
    /// Unix millis before which opportunistic flushes do nothing
    pub next_flush_due: i64,
}

#[cfg(any(test, feature = "test-util"))]
impl<C, W> WriteBackEngine<C, W>
where
    C: Counters,
    W: RowWriter<C>,
{
    /// Sizes of the live cache and pending list, and the next deadline
    pub fn stats(&self) -> EngineStats {
        let state = self.lock();
        EngineStats {
            live_entries: state.live.len(),
            pending_entries: state.pending.len(),
            next_flush_due: state.next_flush_due,
        }
    }

    /// A copy of the live counters for `key`
    pub fn live(&self, key: &C::Key) -> Option<C> {
        self.lock().live.get(key).cloned()
    }

    /// Keys of the snapshots waiting to be persisted, in the order they will be written
    pub fn pending_keys(&self) -> Vec<C::Key> {
        self.lock()
            .pending
            .iter()
            .rev()
            .map(|snapshot| snapshot.key().clone())
            .collect()
    }
}
