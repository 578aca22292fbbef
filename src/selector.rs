// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Target-label matching utilities.
//!
//! `NodeAssignmentGroup` and the pod assignment rules target resources with a
//! plain label map: every key must be present with the exact value, and an
//! empty map matches everything.

use std::collections::BTreeMap;

/// Check whether a resource's labels satisfy a target-label map.
///
/// Every `(key, value)` pair in `target` must be present in `labels` with an
/// identical value. An empty `target` matches everything.
///
/// # Examples
/// ```
/// use std::collections::BTreeMap;
/// use kube_valet::selector::labels_match;
///
/// let mut labels = BTreeMap::new();
/// labels.insert("tier".to_string(), "db".to_string());
///
/// let mut target = BTreeMap::new();
/// target.insert("tier".to_string(), "db".to_string());
///
/// assert!(labels_match(&target, &labels));
/// assert!(labels_match(&BTreeMap::new(), &labels));
/// ```
#[must_use]
pub fn labels_match(target: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    target.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Check whether the targetable labels differ between two label maps.
///
/// Keys under the controller's own domain are ignored so that label writes
/// made by the reconcilers never re-trigger the reconcilers.
#[must_use]
pub fn targetable_labels_differ(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> bool {
    let targetable = |k: &String| !k.contains("kube-valet.io");

    old.iter()
        .filter(|(k, _)| targetable(k))
        .any(|(k, v)| new.get(k) != Some(v))
        || new
            .iter()
            .filter(|(k, _)| targetable(k))
            .any(|(k, v)| old.get(k) != Some(v))
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod selector_tests;
