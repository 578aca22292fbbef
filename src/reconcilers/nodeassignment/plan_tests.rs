// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for assignment planning.

use super::*;
use crate::crd::{NodeAssignment, NodeAssignmentGroupSpec, NodeAssignmentMode};
use crate::patch::node_patch;
use std::collections::BTreeMap;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn node(name: &str, label_pairs: &[(&str, &str)]) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.metadata.labels = Some(labels(label_pairs));
    node
}

fn assignment(name: &str, num_desired: i32) -> NodeAssignment {
    NodeAssignment {
        name: name.to_string(),
        num_desired,
        ..NodeAssignment::default()
    }
}

fn nag(name: &str, spec: NodeAssignmentGroupSpec) -> NodeAssignmentGroup {
    NodeAssignmentGroup::new(name, spec)
}

/// Collect `node name -> assignment` from a plan's final node states,
/// applying deferred unassigns as removals.
fn final_assignments(group: &NodeAssignmentGroup, plan: &AssignmentPlan) -> BTreeMap<String, Option<String>> {
    let mut out = BTreeMap::new();
    for p in &plan.patches {
        out.insert(p.name.clone(), group.assignment_of(&p.new));
    }
    for name in &plan.deferred_unassign {
        out.insert(name.clone(), None);
    }
    out
}

#[test]
fn test_sized_assignments_then_default() {
    // Two sized assignments and a default over four nodes: one node each for
    // a and b, the remaining two land on the default.
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            default_assignment: Some(assignment("c", 0)),
            assignments: vec![assignment("a", 1), assignment("b", 1)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[]), node("n2", &[]), node("n3", &[]), node("n4", &[])];

    let plan = build_plan(&group, &nodes);
    let assigned = final_assignments(&group, &plan);

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for a in assigned.values().flatten() {
        *counts.entry(a.clone()).or_insert(0) += 1;
    }
    assert_eq!(counts.get("a"), Some(&1));
    assert_eq!(counts.get("b"), Some(&1));
    assert_eq!(counts.get("c"), Some(&2));
    assert_eq!(plan.num_matched, 4);
    assert!(plan.deferred_unassign.is_empty());
}

#[test]
fn test_zero_desired_produces_no_changes() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![assignment("a", 0)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[]), node("n2", &[])];

    let plan = build_plan(&group, &nodes);

    assert!(plan.patches.is_empty());
    assert!(plan.deferred_unassign.is_empty());
}

#[test]
fn test_default_only_group_assigns_every_targeted_node() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            default_assignment: Some(assignment("fallback", 0)),
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[]), node("n2", &[])];

    let plan = build_plan(&group, &nodes);
    let assigned = final_assignments(&group, &plan);

    assert_eq!(assigned.len(), 2);
    assert!(assigned
        .values()
        .all(|a| a.as_deref() == Some("fallback")));
}

#[test]
fn test_percent_desired_rounds_down() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![NodeAssignment {
                percent_desired: 50,
                ..assignment("a", 0)
            }],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    // 50% of 3 nodes floors to 1
    let nodes = vec![node("n1", &[]), node("n2", &[]), node("n3", &[])];

    let plan = build_plan(&group, &nodes);
    let assigned = final_assignments(&group, &plan);
    assert_eq!(
        assigned.values().filter(|a| a.as_deref() == Some("a")).count(),
        1
    );
}

#[test]
fn test_plan_is_idempotent() {
    // Running the plan over already-conformant nodes yields zero patches.
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            default_assignment: Some(assignment("c", 0)),
            assignments: vec![assignment("a", 1)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[]), node("n2", &[])];

    let first = build_plan(&group, &nodes);
    // Materialize the first plan's outcome
    let settled: Vec<Node> = first.patches.iter().map(|p| p.new.clone()).collect();
    assert_eq!(settled.len(), 2);

    let second = build_plan(&group, &settled);
    let effective: Vec<_> = second
        .patches
        .iter()
        .filter_map(|p| node_patch(&p.old, &p.new))
        .collect();
    assert!(effective.is_empty());
    assert!(second.deferred_unassign.is_empty());
}

#[test]
fn test_untargeted_node_with_stale_label_is_unassigned() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            target_labels: labels(&[("pool", "workers")]),
            assignments: vec![assignment("a", 1)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let stale = node(
        "n1",
        &[("nag.assignments.kube-valet.io/g", "a")],
    );

    let plan = build_plan(&group, &[stale]);

    assert_eq!(plan.patches.len(), 1);
    assert!(group.assignment_of(&plan.patches[0].new).is_none());
    assert_eq!(plan.num_matched, 0);
}

#[test]
fn test_protected_node_is_cleansed_not_assigned() {
    // A protected node matching targetLabels must never be assigned, and an
    // old assignment is stripped on the next reconcile.
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![assignment("a", 2)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let protected = node(
        "n1",
        &[
            ("nags.kube-valet.io/protected", "true"),
            ("nag.assignments.kube-valet.io/g", "a"),
        ],
    );

    let plan = build_plan(&group, &[protected]);

    assert_eq!(plan.num_matched, 0);
    assert_eq!(plan.patches.len(), 1);
    assert!(group.assignment_of(&plan.patches[0].new).is_none());
}

#[test]
fn test_renamed_assignment_moves_nodes_atomically() {
    // Rename old -> new: both nodes must end on the new assignment via a
    // single patch each, with no intermediate unlabeled state.
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![assignment("new", 2)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![
        node("n1", &[("nag.assignments.kube-valet.io/g", "old")]),
        node("n2", &[("nag.assignments.kube-valet.io/g", "old")]),
    ];

    let plan = build_plan(&group, &nodes);

    assert_eq!(plan.patches.len(), 2);
    for p in &plan.patches {
        // One patch swaps the value directly
        assert_eq!(group.assignment_of(&p.old).as_deref(), Some("old"));
        assert_eq!(group.assignment_of(&p.new).as_deref(), Some("new"));
    }
    assert!(plan.deferred_unassign.is_empty());
}

#[test]
fn test_unknown_assignment_without_capacity_defers_unassign() {
    // A node on an unknown assignment that nothing wants must still be
    // cleansed via the deferred sweep.
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![assignment("a", 0)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[("nag.assignments.kube-valet.io/g", "gone")])];

    let plan = build_plan(&group, &nodes);

    assert!(plan.patches.is_empty());
    assert_eq!(plan.deferred_unassign, vec!["n1".to_string()]);
}

#[test]
fn test_shrinking_assignment_sheds_nodes() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![assignment("a", 1)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![
        node("n1", &[("nag.assignments.kube-valet.io/g", "a")]),
        node("n2", &[("nag.assignments.kube-valet.io/g", "a")]),
    ];

    let plan = build_plan(&group, &nodes);

    // One node stays, one is shed through the deferred sweep
    assert_eq!(plan.deferred_unassign.len(), 1);
    let kept: Vec<_> = plan.patches.iter().collect();
    assert!(kept.is_empty());
}

#[test]
fn test_declaration_order_is_priority_order() {
    // Both assignments want a node; the first declared wins it.
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![assignment("first", 1), assignment("second", 1)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[])];

    let plan = build_plan(&group, &nodes);
    let assigned = final_assignments(&group, &plan);
    assert_eq!(assigned.get("n1").unwrap().as_deref(), Some("first"));
}

#[test]
fn test_default_node_is_pulled_into_hungry_assignment() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            default_assignment: Some(assignment("default", 0)),
            assignments: vec![assignment("a", 1)],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[("nag.assignments.kube-valet.io/g", "default")])];

    let plan = build_plan(&group, &nodes);
    let assigned = final_assignments(&group, &plan);
    assert_eq!(assigned.get("n1").unwrap().as_deref(), Some("a"));
}

#[test]
fn test_label_and_taint_mode_taints_assigned_nodes() {
    let group = nag(
        "g",
        NodeAssignmentGroupSpec {
            assignments: vec![NodeAssignment {
                mode: Some(NodeAssignmentMode::LabelAndTaint),
                ..assignment("a", 1)
            }],
            ..NodeAssignmentGroupSpec::default()
        },
    );
    let nodes = vec![node("n1", &[])];

    let plan = build_plan(&group, &nodes);

    let taints = plan.patches[0]
        .new
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap();
    assert_eq!(taints.len(), 1);
    assert_eq!(taints[0].key, "nag.assignments.kube-valet.io/g");
    assert_eq!(taints[0].effect, "NoSchedule");
}

#[test]
fn test_deletion_style_unassign_covers_all_traces() {
    // The deletion path unassigns every node carrying any attribute for the
    // group; exercise unassign over a node with both label kinds and taints.
    let group = nag("g", NodeAssignmentGroupSpec::default());
    let mut tainted = node(
        "n1",
        &[
            ("nag.assignments.kube-valet.io/g", "a"),
            ("nag.packleft.scheduling.kube-valet.io/g", "Use"),
        ],
    );
    tainted.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
        taints: Some(vec![k8s_openapi::api::core::v1::Taint {
            key: "nag.packleft.scheduling.kube-valet.io/g".to_string(),
            value: Some("Avoid".to_string()),
            effect: "PreferNoSchedule".to_string(),
            time_added: None,
        }]),
        ..Default::default()
    });

    let mut cleaned = tainted.clone();
    group.unassign(&mut cleaned);

    let patch = node_patch(&tainted, &cleaned).unwrap();
    assert_eq!(
        patch["metadata"]["labels"]["nag.assignments.kube-valet.io/g"],
        serde_json::Value::Null
    );
    assert_eq!(
        patch["metadata"]["labels"]["nag.packleft.scheduling.kube-valet.io/g"],
        serde_json::Value::Null
    );
    assert_eq!(patch["spec"]["taints"].as_array().unwrap().len(), 0);
}
