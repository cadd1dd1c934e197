// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counter families and the attributes they share

use std::time::Duration;

use callstats_aggregation::StoreError;
use rusqlite::Connection;

use crate::dimension::Dimensions;

pub mod daily;
pub mod hourly;

/// Upper bounds, in milliseconds, of the first eleven latency buckets
///
/// A twelfth bucket counts everything at or above the last bound.
pub const LATENCY_BOUNDS_MS: [u64; 11] = [10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000, 20000];

/// Index of the latency bucket `elapsed` falls into
///
/// Bucket `i` counts times below `LATENCY_BOUNDS_MS[i]` and at or above the previous bound.
pub fn latency_bucket(elapsed: Duration) -> usize {
    let millis = elapsed.as_millis();
    LATENCY_BOUNDS_MS
        .iter()
        .position(|bound| millis < u128::from(*bound))
        .unwrap_or(LATENCY_BOUNDS_MS.len())
}

/// The outcome of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The call succeeded
    Correct,
    /// The caller sent a request that was rejected
    Invalid,
    /// The call failed on our side
    Failed,
}

/// Identifies where a call was made and through what channel
///
/// Every attribute is optional. Absent, empty and blank values are all stored as the
/// same placeholder, but they remain distinct in the in-memory key: `None` only equals
/// `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// Service name
    pub service: Option<String>,
    /// Method within the service
    pub method: Option<String>,
    /// Where the call came from
    pub origin: Option<String>,
    /// Product line the caller was using
    pub product: Option<String>,
    /// Delivery channel
    pub media: Option<String>,
}

impl CallSite {
    /// A call to `method` on `service`
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            method: Some(method.into()),
            ..Self::default()
        }
    }

    /// Set the origin
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the product
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    /// Set the media
    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }
}

/// Dimension ids of a call site's method, origin and media
#[derive(Debug, Clone, Copy)]
pub(crate) struct SiteIds {
    pub(crate) method: i64,
    pub(crate) origin: i64,
    pub(crate) media: i64,
}

impl SiteIds {
    pub(crate) fn resolve(
        dimensions: &Dimensions,
        conn: &Connection,
        site: &CallSite,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            method: dimensions
                .method()
                .resolve(conn, &[site.service.as_deref(), site.method.as_deref()])?,
            origin: dimensions.origin().resolve(conn, &[site.origin.as_deref()])?,
            media: dimensions.media().resolve(conn, &[site.media.as_deref()])?,
        })
    }

    /// `None` if any of the three has never been stored
    pub(crate) fn lookup(
        dimensions: &Dimensions,
        conn: &Connection,
        site: &CallSite,
    ) -> Result<Option<Self>, StoreError> {
        let method = dimensions
            .method()
            .lookup(conn, &[site.service.as_deref(), site.method.as_deref()])?;
        let origin = dimensions.origin().lookup(conn, &[site.origin.as_deref()])?;
        let media = dimensions.media().lookup(conn, &[site.media.as_deref()])?;
        Ok(match (method, origin, media) {
            (Some(method), Some(origin), Some(media)) => Some(Self {
                method,
                origin,
                media,
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert2::check;
    use rstest::rstest;

    use super::{CallSite, latency_bucket};

    #[rstest]
    #[case(0, 0)]
    #[case(9, 0)]
    #[case(10, 1)]
    #[case(19, 1)]
    #[case(20, 2)]
    #[case(99, 3)]
    #[case(100, 4)]
    #[case(999, 6)]
    #[case(1000, 7)]
    #[case(19_999, 10)]
    #[case(20_000, 11)]
    #[case(3_600_000, 11)]
    fn buckets(#[case] millis: u64, #[case] bucket: usize) {
        check!(latency_bucket(Duration::from_millis(millis)) == bucket);
    }

    #[test]
    fn sub_millisecond_times_land_in_the_first_bucket() {
        check!(latency_bucket(Duration::from_micros(9_999)) == 0);
    }

    #[test]
    fn absent_and_empty_are_different_keys() {
        let absent = CallSite::new("catalog", "getBook");
        let empty = CallSite::new("catalog", "getBook").with_origin("");
        check!(absent != empty);
        check!(absent == CallSite::new("catalog", "getBook"));
    }
}
