// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod collector;
pub mod config;
pub mod dimension;
mod error;
pub mod families;
pub mod schema;
pub mod store;
pub mod text;
mod timer;

pub use collector::{CallStats, DailyStats, FlushSummary, HourlyStats};
pub use config::StatsConfig;
pub use error::{ConfigError, StartupError};
pub use families::{
    CallSite, LATENCY_BOUNDS_MS, Outcome,
    daily::{DailyCounters, DailyKey, DailyRow},
    hourly::{HourlyCounters, HourlyKey, HourlyRow},
    latency_bucket,
};
pub use timer::CallTimer;

pub use callstats_aggregation::{PersistError, StoreError};
pub use callstats_timesource::TimeSource;
