// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Assignment planning for a `NodeAssignmentGroup`.
//!
//! The plan is computed purely from a group and a node-list snapshot; the
//! controller applies it as per-node two-way merge patches. Keeping the walk
//! pure makes every rebalancing rule unit-testable without an API server.
//!
//! Atomicity rule: any node unassigned during planning is tracked in an
//! `unassigned` set. If a later step reassigns it, the node gets exactly one
//! patch that swaps label and taint together; otherwise it lands in the
//! deferred list and is re-fetched and cleansed after the walk. No node ever
//! ends a reconcile in a half-assigned state.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::crd::NodeAssignmentGroup;

/// One node mutation: patch from the `old` snapshot to the desired `new`.
pub struct NodePatch {
    pub name: String,
    pub old: Node,
    pub new: Node,
}

/// The full set of mutations a reconcile will apply.
pub struct AssignmentPlan {
    /// Per-node patches, in walk order.
    pub patches: Vec<NodePatch>,
    /// Nodes unassigned in memory that no reassignment covered; these must
    /// be re-fetched fresh and cleansed.
    pub deferred_unassign: Vec<String>,
    /// Number of nodes matching the group's target labels.
    pub num_matched: i64,
}

/// Compute the mutations that bring `nodes` into conformance with the group.
#[must_use]
pub fn build_plan(nag: &NodeAssignmentGroup, nodes: &[Node]) -> AssignmentPlan {
    let known: HashSet<&str> = nag.all_assignments().map(|a| a.name.as_str()).collect();
    let default_name = nag
        .spec
        .default_assignment
        .as_ref()
        .map(|a| a.name.as_str());

    let mut patches = Vec::new();
    // BTreeSet keeps the final sweep deterministic
    let mut unassigned: BTreeSet<String> = BTreeSet::new();
    // (original snapshot, working copy) per targeted node
    let mut targeted: Vec<(Node, Node)> = Vec::new();

    for node in nodes {
        if nag.targets_node(node) {
            let mut working = node.clone();
            if let Some(current) = nag.assignment_of(&working) {
                if !known.contains(current.as_str()) {
                    warn!(
                        "{} is part of an unknown assignment: {}. Unassigning",
                        working.name_any(),
                        current
                    );
                    // Unassign in memory only so a later reassignment stays
                    // atomic
                    nag.unassign(&mut working);
                    unassigned.insert(working.name_any());
                }
            }
            targeted.push((node.clone(), working));
        } else if nag.assignment_of(node).is_some() {
            debug!(
                "{} is no longer targeted but has an assignment. Unassigning",
                node.name_any()
            );
            let mut cleaned = node.clone();
            nag.unassign(&mut cleaned);
            patches.push(NodePatch {
                name: node.name_any(),
                old: node.clone(),
                new: cleaned,
            });
        }
    }

    // Current satisfaction per non-default assignment
    let mut current: HashMap<String, i64> = HashMap::new();
    for (_, working) in &targeted {
        if let Some(a) = nag.assignment_of(working) {
            if default_name != Some(a.as_str()) {
                *current.entry(a).or_insert(0) += 1;
            }
        }
    }

    // Required changes per assignment: positive wants nodes, negative sheds
    let mut deltas: HashMap<String, i64> = HashMap::new();
    for a in &nag.spec.assignments {
        let desired = a.desired_count(targeted.len());
        let delta = desired - current.get(&a.name).copied().unwrap_or(0);
        if delta != 0 {
            deltas.insert(a.name.clone(), delta);
        }
    }
    debug!("Assignment changes: {:?}", deltas);

    for (original, working) in &mut targeted {
        if let Some(current_assignment) = nag.assignment_of(working) {
            let shedding = deltas
                .get(&current_assignment)
                .is_some_and(|d| *d < 0);
            let on_default = default_name == Some(current_assignment.as_str());

            if shedding || on_default {
                // Unassign in memory; a reassignment below makes the swap
                // atomic in a single patch
                nag.unassign(working);
                unassigned.insert(working.name_any());
                if shedding {
                    if let Some(d) = deltas.get_mut(&current_assignment) {
                        *d += 1;
                        if *d == 0 {
                            deltas.remove(&current_assignment);
                        }
                    }
                }
            } else {
                // Assigned where it should be
                continue;
            }
        }

        // First hungry assignment in declaration order wins
        let mut assigned = false;
        for a in &nag.spec.assignments {
            if deltas.get(&a.name).is_some_and(|d| *d > 0) {
                nag.assign(working, a);
                unassigned.remove(&working.name_any());
                patches.push(NodePatch {
                    name: working.name_any(),
                    old: original.clone(),
                    new: working.clone(),
                });
                if let Some(d) = deltas.get_mut(&a.name) {
                    *d -= 1;
                    if *d == 0 {
                        deltas.remove(&a.name);
                    }
                }
                assigned = true;
                break;
            }
        }

        if !assigned && nag.assignment_of(working).is_none() {
            if let Some(default) = &nag.spec.default_assignment {
                nag.assign(working, default);
                unassigned.remove(&working.name_any());
                patches.push(NodePatch {
                    name: working.name_any(),
                    old: original.clone(),
                    new: working.clone(),
                });
            }
        }
    }

    AssignmentPlan {
        patches,
        deferred_unassign: unassigned.into_iter().collect(),
        num_matched: targeted.len() as i64,
    }
}

#[cfg(test)]
#[path = "plan_tests.rs"]
mod plan_tests;
