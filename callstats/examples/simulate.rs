// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Drives a collector from several threads against a throwaway database, then prints
//! what ended up in the tables.
//!
//! Run with `RUST_LOG=callstats_aggregation=debug` to see batches being written.

use std::{thread, time::Duration};

use callstats::{CallSite, CallStats, StatsConfig};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

const WORKERS: usize = 4;
const CALLS_PER_WORKER: u64 = 500;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;
    let config = StatsConfig::default()
        .database(dir.path().join("simulate.db"))
        .flush_interval(Duration::from_secs(1))
        .max_batch_size(5);
    let stats = CallStats::open(&config)?;

    let sites = [
        CallSite::new("catalog", "getBook").with_origin("web").with_product("books"),
        CallSite::new("catalog", "search").with_origin("mobile").with_media("json"),
        CallSite::new("orders", "place").with_origin("web").with_product("books"),
    ];
    let customers = ["acme", "globex", "initech"];

    thread::scope(|scope| {
        for worker in 0..WORKERS {
            let (stats, sites, customers) = (&stats, &sites, &customers);
            scope.spawn(move || {
                for call in 0..CALLS_PER_WORKER {
                    let n = call as usize + worker;
                    let site = &sites[n % sites.len()];
                    let customer = Some(customers[n % customers.len()]);
                    let mut timer = stats.hourly().timer();
                    thread::sleep(Duration::from_micros(200 + (call % 7) * 300));
                    timer.exclude_while(|| thread::sleep(Duration::from_micros(100)));

                    let elapsed = timer.elapsed();
                    match call % 10 {
                        0 => {
                            stats.daily().register_failed_call(site, customer);
                            stats.hourly().register_failed_call(site, Some("api"), elapsed);
                        }
                        1 | 2 => {
                            stats.daily().register_invalid_call(site, customer);
                            stats.hourly().register_invalid_call(site, Some("api"), elapsed);
                        }
                        _ => {
                            stats.daily().register_correct_call(site, customer);
                            stats.hourly().register_correct_call(site, Some("api"), elapsed);
                        }
                    }
                }
            });
        }
    });

    let summary = stats.flush();
    println!("final flush: {summary:?}");

    let conn = Connection::open(config.database_path())?;
    let mut daily = conn.prepare(
        "SELECT m.service, m.method, d.customer, d.stat_date, d.correct, d.invalid, d.failed
         FROM stat_daily d JOIN stat_dim_method m ON m.id = d.method_id
         ORDER BY m.service, m.method, d.customer",
    )?;
    let rows = daily.query_map([], |row| {
        Ok(format!(
            "{}.{} {} {}: {} correct, {} invalid, {} failed",
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?.trim_end(),
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, i64>(6)?,
        ))
    })?;
    for row in rows {
        println!("{}", row?);
    }

    let total: i64 = conn.query_row(
        "SELECT SUM(correct + invalid + failed) FROM stat_hourly",
        [],
        |row| row.get(0),
    )?;
    println!("hourly rows count {total} calls");
    Ok(())
}
