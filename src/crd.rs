// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) for node and pod assignment.
//!
//! This module defines the Kubernetes Custom Resource Definitions used by
//! kube-valet to partition nodes into assignments and to inject scheduling
//! constraints into pods.
//!
//! # Resource Types
//!
//! - [`NodeAssignmentGroup`] - Partitions a targeted node set into named,
//!   quantitatively-sized assignments expressed as labels and taints
//! - [`PodAssignmentRule`] - Namespaced scheduling constraints for matching pods
//! - [`ClusterPodAssignmentRule`] - Cluster-wide scheduling constraints
//!
//! # Example: Splitting nodes between two teams
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use kube_valet::crd::{NodeAssignment, NodeAssignmentGroupSpec};
//!
//! let spec = NodeAssignmentGroupSpec {
//!     target_labels: BTreeMap::new(), // empty selector targets every node
//!     default_assignment: Some(NodeAssignment {
//!         name: "shared".to_string(),
//!         ..NodeAssignment::default()
//!     }),
//!     assignments: vec![
//!         NodeAssignment {
//!             name: "team-a".to_string(),
//!             num_desired: 2,
//!             ..NodeAssignment::default()
//!         },
//!         NodeAssignment {
//!             name: "team-b".to_string(),
//!             percent_desired: 25,
//!             ..NodeAssignment::default()
//!         },
//!     ],
//! };
//! ```

use k8s_openapi::api::core::v1::{Affinity, Node, Pod, Taint, Toleration};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{DEFAULT_FULL_PERCENT, MIN_AVOID_BUFFER, TAINT_EFFECT_NO_SCHEDULE};
use crate::labels::{
    assignment_key, packleft_key, PROTECTED_LABEL_VALUE, PROTECTED_NODE_LABEL_KEY,
    PROTECTED_POD_LABEL_KEY, PROTECTED_POD_LABEL_VALUE,
};
use crate::selector::labels_match;

/// `NodeAssignmentGroup` partitions a targeted set of nodes into named
/// assignments that are expressed as node labels and, optionally, taints.
///
/// Assignments are declared in priority order: when nodes must be moved, the
/// earliest assignment with unmet demand receives them first.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "assignments.kube-valet.io",
    version = "v1alpha1",
    kind = "NodeAssignmentGroup",
    plural = "nodeassignmentgroups",
    shortname = "nag",
    status = "NodeAssignmentGroupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeAssignmentGroupSpec {
    /// Labels a node must carry to be targeted by this group. An empty map
    /// targets every node in the cluster.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_labels: BTreeMap<String, String>,

    /// Assignment applied to targeted nodes that no sized assignment wants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_assignment: Option<NodeAssignment>,

    /// The assignments to satisfy, ordered most important first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<NodeAssignment>,
}

/// A named slot inside a [`NodeAssignmentGroup`], sized by count and/or
/// percent of the targeted node set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAssignment {
    /// Name used as the assignment label value on matching nodes.
    pub name: String,

    /// Whether nodes in the assignment are labeled, or labeled and tainted.
    /// Unset behaves as `LabelOnly`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<NodeAssignmentMode>,

    /// Effect of the taint when the mode is `LabelAndTaint`. Defaults to
    /// `NoSchedule` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taint_effect: Option<String>,

    /// Number of nodes that should carry this assignment. When both this and
    /// `percentDesired` are given, whichever yields more nodes wins.
    #[serde(default)]
    pub num_desired: i32,

    /// Percentage of targeted nodes that should carry this assignment,
    /// rounded down.
    #[serde(default)]
    pub percent_desired: i32,

    /// Scheduling alteration applied to nodes in the assignment. Unset means
    /// no alteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling_mode: Option<NodeAssignmentSchedulingMode>,

    /// Pack-left tuning. Only consulted when `schedulingMode` is `PackLeft`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack_left: Option<PackLeftScheduling>,
}

/// Tuning for pack-left assignments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackLeftScheduling {
    /// Percent of requested-to-allocatable usage at which a node is
    /// considered full. Defaults to 80.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_percent: Option<i32>,

    /// Number of nodes to hold in the `Avoid` buffer. Small assignments are
    /// fine with 1; very large clusters may want more.
    #[serde(default)]
    pub num_avoid: i32,

    /// Percentage of assignment nodes to hold in the `Avoid` buffer. When
    /// given with `numAvoid`, whichever yields more nodes wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_avoid: Option<i32>,
}

/// Expression mode of a node assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeAssignmentMode {
    /// Only apply the assignment label.
    LabelOnly,
    /// Apply both the assignment label and a matching taint.
    LabelAndTaint,
}

/// Scheduling alteration applied to an assignment's nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeAssignmentSchedulingMode {
    /// Concentrate new workloads on the fullest nodes and protect a fresh
    /// buffer.
    PackLeft,
}

/// Current status of a [`NodeAssignmentGroup`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAssignmentGroupStatus {
    /// Number of nodes that matched the group's target labels on the last
    /// reconcile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_matched: Option<i64>,
}

/// `PodAssignmentRule` describes pods to match and the scheduling constraints
/// to inject into them at admission time.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "assignments.kube-valet.io",
    version = "v1alpha1",
    kind = "PodAssignmentRule",
    plural = "podassignmentrules",
    shortname = "par",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodAssignmentRuleSpec {
    /// Labels a pod must carry for this rule to apply. An empty map matches
    /// every pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_labels: BTreeMap<String, String>,

    /// Scheduling constraints applied to matching pods.
    pub scheduling: PodAssignmentRuleScheduling,
}

/// `ClusterPodAssignmentRule` is a [`PodAssignmentRule`] applied cluster-wide.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "assignments.kube-valet.io",
    version = "v1alpha1",
    kind = "ClusterPodAssignmentRule",
    plural = "clusterpodassignmentrules",
    shortname = "cpar"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPodAssignmentRuleSpec {
    /// Labels a pod must carry for this rule to apply. An empty map matches
    /// every pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_labels: BTreeMap<String, String>,

    /// Scheduling constraints applied to matching pods.
    pub scheduling: PodAssignmentRuleScheduling,
}

/// Scheduling constraints a rule injects into matching pods.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodAssignmentRuleScheduling {
    /// How the rule interacts with scheduling details already on the pod.
    /// Unset behaves as `OverwriteAll`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<PodAssignmentRuleSchedulingMergeStrategy>,

    /// Simple key-value node matching injected into the pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Upstream affinity injected into the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Upstream tolerations injected into the pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

/// Behavior of a rule when the pod already carries scheduling details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PodAssignmentRuleSchedulingMergeStrategy {
    /// Replace each scheduling field the rule declares, leaving the rest of
    /// the pod untouched.
    OverwriteAll,
}

// ============================================================================
// NodeAssignmentGroup helpers
// ============================================================================

impl NodeAssignmentGroup {
    /// Whether this group targets the given node.
    ///
    /// Protected nodes are never targeted. An empty `targetLabels` map
    /// targets every (unprotected) node.
    #[must_use]
    pub fn targets_node(&self, node: &Node) -> bool {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        if labels.get(PROTECTED_NODE_LABEL_KEY).map(String::as_str)
            == Some(PROTECTED_LABEL_VALUE)
        {
            return false;
        }
        labels_match(&self.spec.target_labels, &labels)
    }

    /// The node's current assignment under this group, if any.
    #[must_use]
    pub fn assignment_of(&self, node: &Node) -> Option<String> {
        node.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&self.label_key()))
            .cloned()
    }

    /// Find a declared assignment (including the default) by name.
    #[must_use]
    pub fn find_assignment(&self, name: &str) -> Option<&NodeAssignment> {
        self.spec
            .assignments
            .iter()
            .chain(self.spec.default_assignment.iter())
            .find(|a| a.name == name)
    }

    /// Every declared assignment, default last.
    pub fn all_assignments(&self) -> impl Iterator<Item = &NodeAssignment> {
        self.spec
            .assignments
            .iter()
            .chain(self.spec.default_assignment.iter())
    }

    /// The label/taint key for this group's assignments.
    #[must_use]
    pub fn label_key(&self) -> String {
        assignment_key(&self.name_any())
    }

    /// The label/taint key for this group's pack-left state.
    #[must_use]
    pub fn packleft_label_key(&self) -> String {
        packleft_key(&self.name_any())
    }

    /// Apply an assignment to the node in memory, labeling and, depending on
    /// the assignment mode, tainting it.
    pub fn assign(&self, node: &mut Node, assignment: &NodeAssignment) {
        self.set_label(node, assignment);
        if assignment.mode() == NodeAssignmentMode::LabelAndTaint {
            self.set_taint(node, assignment);
        }
    }

    /// Remove every trace of this group from the node in memory: the
    /// assignment label, the pack-left label, and all taints on either key.
    pub fn unassign(&self, node: &mut Node) {
        let key = self.label_key();
        let pl_key = self.packleft_label_key();

        if let Some(labels) = node.metadata.labels.as_mut() {
            labels.remove(&key);
            labels.remove(&pl_key);
        }
        remove_taints_by_key(node, &key);
        remove_taints_by_key(node, &pl_key);
    }

    fn set_label(&self, node: &mut Node, assignment: &NodeAssignment) {
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(self.label_key(), assignment.name.clone());
    }

    fn set_taint(&self, node: &mut Node, assignment: &NodeAssignment) {
        let key = self.label_key();
        let spec = node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        // Replace rather than accumulate when reassigning
        taints.retain(|t| t.key != key);
        taints.push(Taint {
            key,
            value: Some(assignment.name.clone()),
            effect: assignment.taint_effect(),
            time_added: None,
        });
    }
}

/// Remove every taint on the node whose key matches, regardless of effect.
pub fn remove_taints_by_key(node: &mut Node, key: &str) {
    if let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) {
        taints.retain(|t| t.key != key);
    }
}

// ============================================================================
// NodeAssignment helpers
// ============================================================================

impl NodeAssignment {
    /// Effective expression mode. Unset behaves as `LabelOnly`.
    #[must_use]
    pub fn mode(&self) -> NodeAssignmentMode {
        self.mode.unwrap_or(NodeAssignmentMode::LabelOnly)
    }

    /// Effective taint effect. Unset behaves as `NoSchedule`.
    #[must_use]
    pub fn taint_effect(&self) -> String {
        self.taint_effect
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| TAINT_EFFECT_NO_SCHEDULE.to_string())
    }

    /// Effective number of nodes this assignment wants out of `targeted`
    /// total: the larger of `numDesired` and `percentDesired`, rounded down.
    #[must_use]
    pub fn desired_count(&self, targeted: usize) -> i64 {
        let by_percent = (targeted as i64) * i64::from(self.percent_desired.max(0)) / 100;
        by_percent.max(i64::from(self.num_desired.max(0)))
    }

    /// Whether this assignment uses pack-left balancing.
    #[must_use]
    pub fn is_pack_left(&self) -> bool {
        self.scheduling_mode == Some(NodeAssignmentSchedulingMode::PackLeft)
    }

    /// Node usage fraction (0.0-1.0) at which a node counts as full.
    #[must_use]
    pub fn full_fraction(&self) -> f64 {
        let percent = self
            .pack_left
            .as_ref()
            .and_then(|pl| pl.full_percent)
            .unwrap_or(DEFAULT_FULL_PERCENT);
        f64::from(percent) / 100.0
    }

    /// Effective `Avoid` buffer size for a group of `group_size` nodes:
    /// the larger of `numAvoid` and `percentAvoid`, never below 1.
    #[must_use]
    pub fn avoid_buffer(&self, group_size: usize) -> usize {
        let mut buffer = 0usize;
        if let Some(pl) = &self.pack_left {
            if let Some(percent) = pl.percent_avoid {
                buffer = group_size * usize::try_from(percent.max(0)).unwrap_or(0) / 100;
            }
            let num = usize::try_from(pl.num_avoid.max(0)).unwrap_or(0);
            buffer = buffer.max(num);
        }
        buffer.max(MIN_AVOID_BUFFER)
    }
}

// ============================================================================
// Pod assignment rule helpers
// ============================================================================

/// Whether a pod carries the protection label opting it out of all rules.
#[must_use]
pub fn pod_is_protected(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(PROTECTED_POD_LABEL_KEY))
        .map(String::as_str)
        == Some(PROTECTED_POD_LABEL_VALUE)
}

impl PodAssignmentRule {
    /// Whether this rule targets the given pod.
    #[must_use]
    pub fn targets_pod(&self, pod: &Pod) -> bool {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        labels_match(&self.spec.target_labels, &labels)
    }
}

impl ClusterPodAssignmentRule {
    /// Whether this rule targets the given pod.
    #[must_use]
    pub fn targets_pod(&self, pod: &Pod) -> bool {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        labels_match(&self.spec.target_labels, &labels)
    }
}

impl PodAssignmentRuleScheduling {
    /// Effective merge strategy. Unset behaves as `OverwriteAll`.
    #[must_use]
    pub fn merge_strategy(&self) -> PodAssignmentRuleSchedulingMergeStrategy {
        self.merge_strategy
            .unwrap_or(PodAssignmentRuleSchedulingMergeStrategy::OverwriteAll)
    }

    /// Apply this rule's scheduling details to the pod in memory.
    ///
    /// Under `OverwriteAll` each non-empty field of the rule replaces the
    /// pod's; empty fields leave the pod's values alone, so when multiple
    /// rules match the last non-empty rule wins per field.
    pub fn apply_to_pod(&self, pod: &mut Pod) {
        match self.merge_strategy() {
            PodAssignmentRuleSchedulingMergeStrategy::OverwriteAll => {
                let spec = pod.spec.get_or_insert_with(Default::default);
                if !self.node_selector.is_empty() {
                    spec.node_selector = Some(self.node_selector.clone());
                }
                if let Some(affinity) = &self.affinity {
                    spec.affinity = Some(affinity.clone());
                }
                if !self.tolerations.is_empty() {
                    spec.tolerations = Some(self.tolerations.clone());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
