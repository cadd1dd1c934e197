use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, UNIX_EPOCH},
};

use assert2::{check, let_assert};
use callstats_aggregation::{
    Counters, EngineConfig, InvalidCounters, PersistError, RowWriter, StoreError, WriteBackEngine,
};
use callstats_timesource::{TimeSource, fakes::ManuallyAdvancedTimeSource};
use rstest::rstest;

const INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
struct Outcomes {
    endpoint: String,
    day_of_week: u8,
    correct: i64,
    invalid: i64,
    failed: i64,
}

impl Outcomes {
    fn create(endpoint: &String, day_of_week: u8) -> Result<Self, InvalidCounters> {
        Ok(Self {
            endpoint: endpoint.clone(),
            day_of_week: InvalidCounters::check_day_of_week(day_of_week)?,
            correct: 0,
            invalid: 0,
            failed: 0,
        })
    }

    fn totals(&self) -> (i64, i64, i64) {
        (self.correct, self.invalid, self.failed)
    }
}

impl Counters for Outcomes {
    type Key = String;

    fn key(&self) -> &String {
        &self.endpoint
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
            correct: 0,
            invalid: 0,
            failed: 0,
            ..self.clone()
        }
    }
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<String, (i64, i64, i64)>,
    statements: Vec<&'static str>,
    refuse_connections: bool,
    time_out_updates: bool,
    duplicate_rows: bool,
    concurrent_insert: bool,
    // the insert collides with a row that is gone again by the retried update
    vanishing_duplicate: bool,
    fail_inserts: bool,
}

/// Stand-in for a shared table, with switches to simulate failures and other writers
#[derive(Clone, Default)]
struct MemoryStore(Arc<Mutex<StoreState>>);

impl MemoryStore {
    fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    fn row(&self, endpoint: &str) -> Option<(i64, i64, i64)> {
        self.with(|s| s.rows.get(endpoint).copied())
    }
}

impl RowWriter<Outcomes> for MemoryStore {
    type Connection = ();

    fn connect(&self) -> Result<(), StoreError> {
        if self.with(|s| s.refuse_connections) {
            return Err(StoreError::backend("connection refused"));
        }
        Ok(())
    }

    fn update(&self, _: &mut (), delta: &Outcomes) -> Result<usize, StoreError> {
        self.with(|s| {
            s.statements.push("update");
            if s.time_out_updates {
                return Err(StoreError::backend("statement timed out"));
            }
            if s.duplicate_rows {
                return Ok(2);
            }
            match s.rows.get_mut(&delta.endpoint) {
                Some(row) => {
                    row.0 += delta.correct;
                    row.1 += delta.invalid;
                    row.2 += delta.failed;
                    Ok(1)
                }
                None => Ok(0),
            }
        })
    }

    fn insert(&self, _: &mut (), delta: &Outcomes) -> Result<(), StoreError> {
        self.with(|s| {
            s.statements.push("insert");
            if s.fail_inserts {
                return Err(StoreError::backend("disk full"));
            }
            if s.vanishing_duplicate {
                return Err(StoreError::unique_violation("duplicate key"));
            }
            if std::mem::take(&mut s.concurrent_insert) {
                // another process got there between our update and insert
                s.rows.insert(delta.endpoint.clone(), (100, 0, 0));
            }
            if s.rows.contains_key(&delta.endpoint) {
                return Err(StoreError::unique_violation("duplicate key"));
            }
            s.rows
                .insert(delta.endpoint.clone(), delta.totals());
            Ok(())
        })
    }
}

type Engine = WriteBackEngine<Outcomes, MemoryStore>;

struct Harness {
    engine: Engine,
    store: MemoryStore,
    clock: ManuallyAdvancedTimeSource,
}

fn harness(batch: usize) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let clock = ManuallyAdvancedTimeSource::at_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    let store = MemoryStore::default();
    let engine = WriteBackEngine::new(
        "outcomes",
        store.clone(),
        EngineConfig::new()
            .flush_interval(INTERVAL)
            .max_batch_size(batch),
        TimeSource::custom(clock.clone()),
    );
    Harness {
        engine,
        store,
        clock,
    }
}

enum Outcome {
    Correct,
    Invalid,
    Failed,
}

impl Harness {
    fn now(&self) -> i64 {
        TimeSource::custom(self.clock.clone()).unix_millis()
    }

    fn increment(&self, endpoint: &str, outcome: Outcome) {
        self.engine
            .increment(
                endpoint.to_string(),
                |key| Outcomes::create(key, 3),
                |c| match outcome {
                    Outcome::Correct => c.correct += 1,
                    Outcome::Invalid => c.invalid += 1,
                    Outcome::Failed => c.failed += 1,
                },
            )
            .unwrap();
    }

    fn register(&self, endpoint: &str) {
        self.engine
            .register(
                endpoint.to_string(),
                |key| Outcomes::create(key, 3),
                |c| c.correct += 1,
            )
            .unwrap();
    }

    fn pass_deadline(&self) {
        self.clock.advance(INTERVAL);
    }
}

#[test]
fn flush_persists_counts_and_evicts_entry() {
    let h = harness(10);
    for _ in 0..3 {
        h.increment("/orders", Outcome::Correct);
    }
    h.increment("/orders", Outcome::Invalid);
    h.increment("/orders", Outcome::Invalid);
    h.increment("/orders", Outcome::Failed);
    check!(h.engine.live(&"/orders".to_string()).map(|c| c.day_of_week) == Some(3));

    check!(h.engine.flush().unwrap() == 1);

    check!(h.store.row("/orders") == Some((3, 2, 1)));
    check!(h.engine.live(&"/orders".to_string()) == None);
    check!(h.engine.stats().live_entries == 0);
    check!(h.store.with(|s| s.statements.clone()) == ["update", "insert"]);
}

#[test]
fn second_flush_updates_existing_row() {
    let h = harness(10);
    h.increment("/orders", Outcome::Correct);
    h.engine.flush().unwrap();
    h.increment("/orders", Outcome::Failed);
    h.engine.flush().unwrap();

    check!(h.store.row("/orders") == Some((1, 0, 1)));
    check!(h.store.with(|s| s.statements.clone()) == ["update", "insert", "update"]);
}

#[test]
fn failed_flush_keeps_counts_and_backs_off_one_interval() {
    let h = harness(10);
    for _ in 0..3 {
        h.increment("/orders", Outcome::Correct);
    }
    h.increment("/refunds", Outcome::Failed);
    h.store.with(|s| s.time_out_updates = true);

    h.pass_deadline();
    let failed_at = h.now();
    let_assert!(Err(PersistError::Store(StoreError::Backend(_))) = h.engine.allow_store());

    let stats = h.engine.stats();
    check!(stats.pending_entries == 0);
    check!(stats.live_entries == 2);
    check!(stats.next_flush_due == failed_at + INTERVAL.as_millis() as i64);
    check!(h.engine.live(&"/orders".to_string()).map(|c| c.totals()) == Some((3, 0, 0)));
    check!(h.engine.live(&"/refunds".to_string()).map(|c| c.totals()) == Some((0, 0, 1)));

    // nothing is attempted again until the backoff has passed
    h.store.with(|s| {
        s.time_out_updates = false;
        s.statements.clear();
    });
    check!(h.engine.allow_store().unwrap() == 0);
    check!(h.store.with(|s| s.statements.len()) == 0);

    h.pass_deadline();
    check!(h.engine.allow_store().unwrap() == 2);
    check!(h.store.row("/orders") == Some((3, 0, 0)));
    check!(h.store.row("/refunds") == Some((0, 0, 1)));
}

#[test]
fn refused_connection_abandons_batch() {
    let h = harness(10);
    h.increment("/orders", Outcome::Correct);
    h.store.with(|s| s.refuse_connections = true);

    let_assert!(Err(PersistError::Connect(_)) = h.engine.flush());
    check!(h.engine.stats().pending_entries == 0);
    check!(h.engine.live(&"/orders".to_string()).map(|c| c.totals()) == Some((1, 0, 0)));
}

#[test]
fn increments_between_cycles_survive_subtraction() {
    let h = harness(2);
    for endpoint in ["/a", "/b", "/c"] {
        h.increment(endpoint, Outcome::Correct);
        h.increment(endpoint, Outcome::Correct);
    }

    h.pass_deadline();
    check!(h.engine.allow_store().unwrap() == 2);
    let pending = h.engine.pending_keys();
    let_assert!([unflushed] = pending.as_slice());
    let unflushed = unflushed.clone();
    check!(h.store.row(&unflushed) == None);

    h.increment(&unflushed, Outcome::Failed);

    // the pending snapshot still carries the pre-increment amounts
    check!(h.engine.allow_store().unwrap() == 1);
    check!(h.store.row(&unflushed) == Some((2, 0, 0)));
    check!(h.engine.live(&unflushed).map(|c| c.totals()) == Some((0, 0, 1)));
    check!(h.engine.stats().live_entries == 1);

    h.engine.flush().unwrap();
    check!(h.store.row(&unflushed) == Some((2, 0, 1)));
    check!(h.engine.stats().live_entries == 0);
}

#[test]
fn insert_race_retries_update() {
    let h = harness(10);
    h.increment("/orders", Outcome::Invalid);
    h.store.with(|s| s.concurrent_insert = true);

    check!(h.engine.flush().unwrap() == 1);

    check!(h.store.row("/orders") == Some((100, 1, 0)));
    check!(h.store.with(|s| s.statements.clone()) == ["update", "insert", "update"]);
    check!(h.engine.stats().live_entries == 0);
}

#[test]
fn update_touching_several_rows_is_an_integrity_error() {
    let h = harness(10);
    h.increment("/orders", Outcome::Correct);
    h.store.with(|s| s.duplicate_rows = true);

    let_assert!(Err(err) = h.engine.flush());
    check!(err.is_integrity_error());
    let_assert!(PersistError::UnexpectedRowCount { affected: 2, .. } = err);
    check!(h.engine.live(&"/orders".to_string()).map(|c| c.totals()) == Some((1, 0, 0)));
}

#[test]
fn retried_update_missing_its_row_abandons_batch() {
    let h = harness(10);
    for endpoint in ["/a", "/b", "/c"] {
        h.increment(endpoint, Outcome::Correct);
    }
    h.store.with(|s| s.vanishing_duplicate = true);

    h.pass_deadline();
    let failed_at = h.now();
    let_assert!(Err(err) = h.engine.allow_store());
    check!(err.is_integrity_error());
    let_assert!(
        PersistError::UnexpectedRowCount {
            statement: "retried update",
            affected: 0,
        } = err
    );
    check!(h.store.with(|s| s.statements.clone()) == ["update", "insert", "update"]);

    let stats = h.engine.stats();
    check!(stats.pending_entries == 0);
    check!(stats.live_entries == 3);
    check!(stats.next_flush_due == failed_at + INTERVAL.as_millis() as i64);
    for endpoint in ["/a", "/b", "/c"] {
        check!(h.engine.live(&endpoint.to_string()).map(|c| c.totals()) == Some((1, 0, 0)));
    }
}

#[test]
fn failed_insert_is_not_retried() {
    let h = harness(10);
    h.increment("/orders", Outcome::Correct);
    h.increment("/orders", Outcome::Invalid);
    h.store.with(|s| s.fail_inserts = true);

    let_assert!(Err(err) = h.engine.flush());
    check!(!err.is_integrity_error());
    let_assert!(PersistError::Store(StoreError::Backend(_)) = err);
    check!(h.store.with(|s| s.statements.clone()) == ["update", "insert"]);
    check!(h.store.row("/orders") == None);
    check!(h.engine.stats().pending_entries == 0);
    check!(h.engine.live(&"/orders".to_string()).map(|c| c.totals()) == Some((1, 1, 0)));
}

#[test]
fn opportunistic_flush_waits_for_deadline() {
    let h = harness(10);
    h.register("/orders");
    h.register("/orders");
    check!(h.store.with(|s| s.statements.len()) == 0);

    h.pass_deadline();
    h.register("/orders");
    check!(h.store.row("/orders") == Some((3, 0, 0)));
    check!(h.engine.stats().live_entries == 0);
    check!(h.engine.stats().next_flush_due == h.now() + INTERVAL.as_millis() as i64);
}

#[test]
fn empty_cache_only_moves_deadline() {
    let h = harness(10);
    h.pass_deadline();
    h.clock.advance(Duration::from_secs(5));

    check!(h.engine.allow_store().unwrap() == 0);
    check!(h.engine.stats().next_flush_due == h.now() + INTERVAL.as_millis() as i64);
    check!(h.store.with(|s| s.statements.len()) == 0);
}

#[test]
fn rejected_counters_are_not_cached() {
    let h = harness(10);
    let result = h.engine.register(
        "/orders".to_string(),
        |key| Outcomes::create(key, 9),
        |c| c.correct += 1,
    );
    check!(result == Err(InvalidCounters::DayOfWeek(9)));
    check!(h.engine.stats().live_entries == 0);
}

#[rstest]
#[case::one_at_a_time(1, 5, 1)]
#[case::partial(2, 5, 2)]
#[case::everything(10, 5, 5)]
fn batches_are_bounded(#[case] batch: usize, #[case] keys: usize, #[case] written: usize) {
    let h = harness(batch);
    for i in 0..keys {
        h.increment(&format!("/endpoint/{i}"), Outcome::Correct);
    }
    h.pass_deadline();

    check!(h.engine.allow_store().unwrap() == written);
    check!(h.engine.stats().pending_entries == keys - written);
    check!(h.engine.stats().live_entries == keys - written);
}

#[test]
fn drain_ignores_batch_bound() {
    let h = harness(2);
    for i in 0..7 {
        h.increment(&format!("/endpoint/{i}"), Outcome::Correct);
    }
    check!(h.engine.flush().unwrap() == 7);
    check!(h.engine.stats().live_entries == 0);
    check!(h.engine.stats().pending_entries == 0);
}

#[test]
fn concurrent_registration_converges_in_store() {
    const THREADS: usize = 8;
    const CALLS: usize = 2_000;

    let h = harness(3);
    let endpoints = ["/a", "/b", "/c", "/d", "/e"];
    std::thread::scope(|s| {
        for t in 0..THREADS {
            let h = &h;
            s.spawn(move || {
                for i in 0..CALLS {
                    h.register(endpoints[(t + i) % endpoints.len()]);
                }
            });
        }
        for _ in 0..20 {
            h.pass_deadline();
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    h.engine.flush().unwrap();

    let total: i64 = endpoints
        .iter()
        .filter_map(|e| h.store.row(e))
        .map(|(correct, _, _)| correct)
        .sum();
    check!(total == (THREADS * CALLS) as i64);
    check!(h.engine.stats().live_entries == 0);
}
