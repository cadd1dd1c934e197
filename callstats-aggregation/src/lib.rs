// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod engine;
pub mod error;
pub mod traits;

pub use config::EngineConfig;
pub use engine::WriteBackEngine;
#[cfg(any(test, feature = "test-util"))]
pub use engine::EngineStats;
pub use error::{BoxError, InvalidCounters, PersistError, StoreError};
pub use traits::{Counters, RowWriter, Snapshot};
