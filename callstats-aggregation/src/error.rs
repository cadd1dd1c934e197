// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types

use std::{error::Error, fmt};

/// Boxed error from a storage backend
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// A failure reported by a storage backend
#[derive(Debug)]
pub enum StoreError {
    /// An insert collided with an existing row, usually one another process just created
    UniqueViolation(BoxError),
    /// Any other storage failure: lost connections, timeouts, bad statements
    Backend(BoxError),
}

impl StoreError {
    /// Wrap a backend error
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    /// Wrap a uniqueness violation
    pub fn unique_violation(err: impl Into<BoxError>) -> Self {
        Self::UniqueViolation(err.into())
    }

    /// Whether this error is a uniqueness violation
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UniqueViolation(err) => write!(f, "uniqueness violation: {err}"),
            Self::Backend(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UniqueViolation(err) | Self::Backend(err) => Some(err.as_ref()),
        }
    }
}

/// Why persisting a snapshot failed
///
/// Any of these abandons the current batch.
#[derive(Debug)]
pub enum PersistError {
    /// No connection could be acquired for the batch
    Connect(StoreError),
    /// A statement failed
    Store(StoreError),
    /// A statement touched an unexpected number of rows
    UnexpectedRowCount {
        /// Which step of the update/insert/update protocol
        statement: &'static str,
        /// Rows the statement reported as affected
        affected: usize,
    },
}

impl PersistError {
    /// Whether this points at corrupt data or a broken statement rather than an unavailable store
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::UnexpectedRowCount { .. })
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "failed to connect: {err}"),
            Self::Store(err) => fmt::Display::fmt(err, f),
            Self::UnexpectedRowCount {
                statement,
                affected,
            } => write!(f, "{statement} affected {affected} rows, expected 1"),
        }
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connect(err) | Self::Store(err) => Some(err),
            Self::UnexpectedRowCount { .. } => None,
        }
    }
}

impl From<StoreError> for PersistError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Counters were rejected at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCounters {
    /// Day of week outside `0..=6`
    DayOfWeek(u8),
    /// Hour of day outside `0..=23`
    HourOfDay(u8),
}

impl InvalidCounters {
    /// Pass `day_of_week` through if it is within `0..=6`
    pub fn check_day_of_week(day_of_week: u8) -> Result<u8, Self> {
        if day_of_week <= 6 {
            Ok(day_of_week)
        } else {
            Err(Self::DayOfWeek(day_of_week))
        }
    }

    /// Pass `hour_of_day` through if it is within `0..=23`
    pub fn check_hour_of_day(hour_of_day: u8) -> Result<u8, Self> {
        if hour_of_day <= 23 {
            Ok(hour_of_day)
        } else {
            Err(Self::HourOfDay(hour_of_day))
        }
    }
}

impl fmt::Display for InvalidCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DayOfWeek(day) => write!(f, "day of week {day} is outside 0..=6"),
            Self::HourOfDay(hour) => write!(f, "hour of day {hour} is outside 0..=23"),
        }
    }
}

impl Error for InvalidCounters {}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::{InvalidCounters, PersistError, StoreError};

    #[test]
    fn day_and_hour_bounds() {
        check!(InvalidCounters::check_day_of_week(0) == Ok(0));
        check!(InvalidCounters::check_day_of_week(6) == Ok(6));
        check!(InvalidCounters::check_day_of_week(7) == Err(InvalidCounters::DayOfWeek(7)));
        check!(InvalidCounters::check_hour_of_day(23) == Ok(23));
        check!(InvalidCounters::check_hour_of_day(24) == Err(InvalidCounters::HourOfDay(24)));
    }

    #[test]
    fn messages() {
        let err = PersistError::UnexpectedRowCount {
            statement: "update",
            affected: 2,
        };
        check!(err.to_string() == "update affected 2 rows, expected 1");
        check!(err.is_integrity_error());

        let err = PersistError::from(StoreError::backend("connection reset"));
        check!(err.to_string() == "storage error: connection reset");
        check!(!err.is_integrity_error());
    }
}
