// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Pack-left node ranking and classification.
//!
//! Nodes are ranked by resource fullness and classified Use / Avoid / Deny.
//! The fullest nodes stay open (`Use`) so the scheduler keeps packing them,
//! a small buffer is discouraged (`Avoid`), and the remainder is closed
//! (`Deny`) until the gradient shifts.
//!
//! Per group and node the states form a small machine
//! `{Unmanaged, Use, Avoid, Deny}`: classification drives every transition,
//! absence of the pack-left label is `Unmanaged`, and group deletion returns
//! every node to `Unmanaged`.

use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;
use std::collections::HashMap;

use crate::constants::{TAINT_EFFECT_NO_SCHEDULE, TAINT_EFFECT_PREFER_NO_SCHEDULE};
use crate::quantity::{parse_millicores, parse_quantity};

/// Managed pack-left state of a node, expressed as the pack-left label value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackLeftState {
    Use,
    Avoid,
    Deny,
}

impl PackLeftState {
    /// The label (and taint) value for this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PackLeftState::Use => "Use",
            PackLeftState::Avoid => "Avoid",
            PackLeftState::Deny => "Deny",
        }
    }
}

/// Whether a node may participate in balancing: schedulable and Ready.
#[must_use]
pub fn node_can_be_balanced(node: &Node) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");

    !unschedulable && ready
}

/// Group pods by the node they are bound to.
#[must_use]
pub fn pods_by_node(pods: &[&Pod]) -> HashMap<String, Vec<Pod>> {
    let mut by_node: HashMap<String, Vec<Pod>> = HashMap::new();
    for pod in pods {
        if let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
            by_node.entry(node_name).or_default().push((*pod).clone());
        }
    }
    by_node
}

/// Fraction of the node's allocatable resources requested by its pods:
/// `max(memory fraction, cpu fraction)`, CPU compared at millicore
/// resolution. Completed pods do not count against schedulable capacity.
#[must_use]
pub fn percent_full(node: &Node, pods: &[Pod]) -> f64 {
    percent_full_memory(node, pods).max(percent_full_cpu(node, pods))
}

fn percent_full_memory(node: &Node, pods: &[Pod]) -> f64 {
    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("memory"))
        .and_then(parse_quantity)
        .unwrap_or(0.0);
    if allocatable <= 0.0 {
        return 0.0;
    }

    let requested: f64 = running_container_requests(pods, "memory", parse_quantity);
    requested / allocatable
}

fn percent_full_cpu(node: &Node, pods: &[Pod]) -> f64 {
    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("cpu"))
        .and_then(parse_millicores)
        .unwrap_or(0.0);
    if allocatable <= 0.0 {
        return 0.0;
    }

    let requested: f64 = running_container_requests(pods, "cpu", parse_millicores);
    requested / allocatable
}

fn running_container_requests<F>(pods: &[Pod], resource: &str, parse: F) -> f64
where
    F: Fn(&k8s_openapi::apimachinery::pkg::api::resource::Quantity) -> Option<f64>,
{
    pods.iter()
        .filter(|p| {
            // Completed pods no longer hold their requests
            p.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Succeeded")
        })
        .flat_map(|p| p.spec.iter().flat_map(|s| s.containers.iter()))
        .filter_map(|c| {
            c.resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|req| req.get(resource))
                .and_then(&parse)
        })
        .sum()
}

/// Sort nodes fullest-first.
///
/// Ties break on node name, descending. The tie-break is load-bearing: equal
/// fullness is common on idle nodes, and an unstable order would flip
/// classifications between reconciles and churn labels forever.
pub fn rank(nodes: &mut [(f64, Node)]) {
    nodes.sort_by(|(pa, na), (pb, nb)| {
        pb.partial_cmp(pa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| nb.name_any().cmp(&na.name_any()))
    });
}

/// Classify ranked nodes.
///
/// The first (fullest) node is always `Use`. Each subsequent node is `Use`
/// when over the fullness threshold, `Avoid` while the buffer has room, and
/// `Deny` after that.
#[must_use]
pub fn classify(
    ranked: &[(f64, Node)],
    full_fraction: f64,
    avoid_buffer: usize,
) -> Vec<(f64, Node, PackLeftState)> {
    let mut classified = Vec::with_capacity(ranked.len());
    let mut avoid_count = 0usize;

    for (i, (fullness, node)) in ranked.iter().enumerate() {
        let state = if i == 0 {
            PackLeftState::Use
        } else if *fullness > full_fraction {
            PackLeftState::Use
        } else if avoid_count < avoid_buffer {
            avoid_count += 1;
            PackLeftState::Avoid
        } else {
            PackLeftState::Deny
        };
        classified.push((*fullness, node.clone(), state));
    }

    classified
}

/// Number of nodes classified `Avoid`.
#[must_use]
pub fn avoid_count(classified: &[(f64, Node, PackLeftState)]) -> usize {
    classified
        .iter()
        .filter(|(_, _, s)| *s == PackLeftState::Avoid)
        .count()
}

/// Produce the node's desired shape for a pack-left state: label set to the
/// state, existing taints on the key removed, and an `Avoid`/`Deny` taint
/// re-added.
#[must_use]
pub fn with_packleft_state(node: &Node, label_key: &str, state: PackLeftState) -> Node {
    let mut desired = node.clone();

    desired
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(label_key.to_string(), state.as_str().to_string());

    crate::crd::remove_taints_by_key(&mut desired, label_key);

    if state != PackLeftState::Use {
        let effect = match state {
            PackLeftState::Deny => TAINT_EFFECT_NO_SCHEDULE,
            _ => TAINT_EFFECT_PREFER_NO_SCHEDULE,
        };
        desired
            .spec
            .get_or_insert_with(Default::default)
            .taints
            .get_or_insert_with(Vec::new)
            .push(Taint {
                key: label_key.to_string(),
                value: Some(state.as_str().to_string()),
                effect: effect.to_string(),
                time_added: None,
            });
    }

    desired
}

/// Produce the node's shape with all pack-left attributes for the key
/// removed.
#[must_use]
pub fn without_packleft_state(node: &Node, label_key: &str) -> Node {
    let mut desired = node.clone();
    if let Some(labels) = desired.metadata.labels.as_mut() {
        labels.remove(label_key);
    }
    crate::crd::remove_taints_by_key(&mut desired, label_key);
    desired
}

/// Whether the node carries any pack-left label or taint on the key.
#[must_use]
pub fn has_packleft_attributes(node: &Node, label_key: &str) -> bool {
    let labeled = node
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(label_key));
    let tainted = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == label_key));
    labeled || tainted
}

#[cfg(test)]
#[path = "balance_tests.rs"]
mod balance_tests;
