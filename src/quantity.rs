// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Kubernetes resource quantity parsing.
//!
//! Pack-left fullness is computed from pod resource requests against node
//! allocatable, which the API expresses as quantity strings: plain numbers,
//! decimal SI suffixes (`k`, `M`, `G`, ...), binary suffixes (`Ki`, `Mi`,
//! `Gi`, ...), the milli suffix (`m`), and scientific notation.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a quantity into its value in base units.
///
/// `"128974848"`, `"129e6"`, `"129M"`, and `"123Mi"` parse to their byte
/// counts; `"250m"` parses to `0.25`. Returns `None` for malformed input.
#[must_use]
pub fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }

    let (number, multiplier) = match s {
        _ if s.ends_with("Ki") => (&s[..s.len() - 2], 1024f64),
        _ if s.ends_with("Mi") => (&s[..s.len() - 2], 1024f64.powi(2)),
        _ if s.ends_with("Gi") => (&s[..s.len() - 2], 1024f64.powi(3)),
        _ if s.ends_with("Ti") => (&s[..s.len() - 2], 1024f64.powi(4)),
        _ if s.ends_with("Pi") => (&s[..s.len() - 2], 1024f64.powi(5)),
        _ if s.ends_with("Ei") => (&s[..s.len() - 2], 1024f64.powi(6)),
        _ if s.ends_with('m') => (&s[..s.len() - 1], 1e-3),
        _ if s.ends_with('k') => (&s[..s.len() - 1], 1e3),
        _ if s.ends_with('M') => (&s[..s.len() - 1], 1e6),
        _ if s.ends_with('G') => (&s[..s.len() - 1], 1e9),
        _ if s.ends_with('T') => (&s[..s.len() - 1], 1e12),
        _ if s.ends_with('P') => (&s[..s.len() - 1], 1e15),
        _ if s.ends_with('E') => (&s[..s.len() - 1], 1e18),
        // plain numbers and scientific notation ("129e6")
        _ => (s, 1f64),
    };

    number.parse::<f64>().ok().map(|n| n * multiplier)
}

/// Parse a CPU quantity at millicore resolution.
///
/// `"1"` parses to `1000.0`, `"250m"` to `250.0`.
#[must_use]
pub fn parse_millicores(quantity: &Quantity) -> Option<f64> {
    parse_quantity(quantity).map(|v| v * 1000.0)
}

#[cfg(test)]
#[path = "quantity_tests.rs"]
mod quantity_tests;
