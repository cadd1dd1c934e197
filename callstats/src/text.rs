// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Normalization of free-text attributes before they reach storage

/// Stored in place of a missing, empty or whitespace-only value
pub const PLACEHOLDER: &str = "-";

/// Trim `raw`, substitute [`PLACEHOLDER`] when nothing is left, and cut to `width` characters
pub fn normalize(raw: Option<&str>, width: usize) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.chars().take(width).collect(),
        _ => PLACEHOLDER.to_owned(),
    }
}

/// [`normalize`], then right-pad with spaces to exactly `width` characters
///
/// Used for the fixed-width key columns, so that the same logical value always
/// compares equal in SQL regardless of how the backend treats `CHAR` padding.
pub fn pad_fixed(raw: Option<&str>, width: usize) -> String {
    format!("{:<width$}", normalize(raw, width))
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use rstest::rstest;

    use super::{PLACEHOLDER, normalize, pad_fixed};

    #[rstest]
    #[case::missing(None, PLACEHOLDER)]
    #[case::empty(Some(""), PLACEHOLDER)]
    #[case::blank(Some(" \t "), PLACEHOLDER)]
    #[case::trimmed(Some("  web "), "web")]
    #[case::truncated(Some("mobile-app"), "mobil")]
    #[case::multibyte(Some("éèêëē"), "éèêëē")]
    fn normalizes(#[case] raw: Option<&str>, #[case] expected: &str) {
        check!(normalize(raw, 5) == expected);
    }

    #[test]
    fn pads_to_width() {
        check!(pad_fixed(Some(" gold "), 8) == "gold    ");
        check!(pad_fixed(None, 4) == "-   ");
        check!(pad_fixed(Some("platinum-plus"), 8) == "platinum");
    }
}
