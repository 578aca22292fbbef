// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for target-label matching.

use super::*;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn test_empty_target_matches_everything() {
    let target = BTreeMap::new();
    assert!(labels_match(&target, &labels(&[("app", "web")])));
    assert!(labels_match(&target, &BTreeMap::new()));
}

#[test]
fn test_all_pairs_must_match() {
    let target = labels(&[("app", "web"), ("env", "prod")]);

    assert!(labels_match(
        &target,
        &labels(&[("app", "web"), ("env", "prod"), ("extra", "x")])
    ));
    // Missing key
    assert!(!labels_match(&target, &labels(&[("app", "web")])));
    // Wrong value
    assert!(!labels_match(
        &target,
        &labels(&[("app", "web"), ("env", "dev")])
    ));
}

#[test]
fn test_target_against_empty_labels() {
    let target = labels(&[("app", "web")]);
    assert!(!labels_match(&target, &BTreeMap::new()));
}

#[test]
fn test_targetable_labels_differ_detects_changes() {
    let old = labels(&[("app", "web")]);
    let new = labels(&[("app", "api")]);
    assert!(targetable_labels_differ(&old, &new));

    let added = labels(&[("app", "web"), ("tier", "db")]);
    assert!(targetable_labels_differ(&old, &added));

    let removed = BTreeMap::new();
    assert!(targetable_labels_differ(&old, &removed));

    assert!(!targetable_labels_differ(&old, &old.clone()));
}

#[test]
fn test_targetable_labels_ignore_controller_keys() {
    // Labels the reconcilers write must not re-trigger reconciliation.
    let old = labels(&[("app", "web")]);
    let new = labels(&[
        ("app", "web"),
        ("nag.assignments.kube-valet.io/group", "a"),
        ("nag.packleft.scheduling.kube-valet.io/group", "Use"),
    ]);
    assert!(!targetable_labels_differ(&old, &new));
}
