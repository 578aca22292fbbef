// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for pack-left assignment membership checks.

use super::*;
use crate::crd::{NodeAssignmentGroupSpec, NodeAssignmentSchedulingMode};
use std::collections::BTreeMap;

fn node_assigned_to(nag_name: &str, assignment: &str) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert(
        format!("nag.assignments.kube-valet.io/{nag_name}"),
        assignment.to_string(),
    );
    let mut node = Node::default();
    node.metadata.name = Some("n1".to_string());
    node.metadata.labels = Some(labels);
    node
}

fn packleft_assignment(name: &str) -> NodeAssignment {
    NodeAssignment {
        name: name.to_string(),
        scheduling_mode: Some(NodeAssignmentSchedulingMode::PackLeft),
        ..NodeAssignment::default()
    }
}

#[test]
fn test_node_in_packleft_assignment() {
    let nag = NodeAssignmentGroup::new(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![packleft_assignment("x")],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    assert!(node_has_packleft_assignment(&node_assigned_to("g", "x"), &nag));
}

#[test]
fn test_node_in_plain_assignment_is_not_packleft() {
    let nag = NodeAssignmentGroup::new(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![NodeAssignment {
                name: "x".to_string(),
                ..NodeAssignment::default()
            }],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    assert!(!node_has_packleft_assignment(&node_assigned_to("g", "x"), &nag));
}

#[test]
fn test_unassigned_node_is_not_packleft() {
    let nag = NodeAssignmentGroup::new(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![packleft_assignment("x")],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let mut bare = Node::default();
    bare.metadata.name = Some("n1".to_string());
    assert!(!node_has_packleft_assignment(&bare, &nag));
}

#[test]
fn test_packleft_default_assignment_counts() {
    let nag = NodeAssignmentGroup::new(
        "g",
        NodeAssignmentGroupSpec {
            default_assignment: Some(packleft_assignment("fallback")),
            ..NodeAssignmentGroupSpec::default()
        },
    );
    assert!(node_has_packleft_assignment(
        &node_assigned_to("g", "fallback"),
        &nag
    ));
}
