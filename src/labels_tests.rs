// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for label and taint key construction.

use super::*;

#[test]
fn test_assignment_key_uses_api_group() {
    assert_eq!(
        assignment_key("my-group"),
        "nag.assignments.kube-valet.io/my-group"
    );
}

#[test]
fn test_packleft_key_uses_domain() {
    assert_eq!(
        packleft_key("my-group"),
        "nag.packleft.scheduling.kube-valet.io/my-group"
    );
}

#[test]
fn test_keys_are_disjoint() {
    // The node assignment reconciler and the pack-left balancer write
    // concurrently; their key spaces must never collide.
    assert_ne!(assignment_key("g"), packleft_key("g"));
}
