// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{error::Error, fmt, io};

use callstats_aggregation::StoreError;

/// A configuration file could not be used
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read
    Read(io::Error),
    /// The file is not valid TOML for [`crate::StatsConfig`]
    Parse(toml::de::Error),
    /// A setting is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(err) => write!(f, "failed to read configuration: {err}"),
            Self::Parse(err) => write!(f, "failed to parse configuration: {err}"),
            Self::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Read(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Read(value)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}

/// [`crate::CallStats`] could not be created
#[derive(Debug)]
pub enum StartupError {
    /// The configuration was rejected
    Config(ConfigError),
    /// The database could not be reached or its tables created
    Store(StoreError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => fmt::Display::fmt(err, f),
            Self::Store(err) => write!(f, "failed to prepare the statistics database: {err}"),
        }
    }
}

impl Error for StartupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<StoreError> for StartupError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}
