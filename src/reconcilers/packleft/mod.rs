// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Pack-left balancing.
//!
//! For every `NodeAssignmentGroup` with a pack-left assignment, the balancer
//! classifies the assignment's nodes as Use / Avoid / Deny and patches the
//! matching labels and taints so the platform scheduler concentrates new
//! workloads on a small set of nodes while protecting a fresh buffer.
//!
//! The balancer and the node assignment reconciler can race on the same
//! node; this is safe because they write disjoint label and taint key
//! spaces.

pub mod balance;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::constants::KIND_NODE_ASSIGNMENT_GROUP;
use crate::context::Context;
use crate::crd::{NodeAssignment, NodeAssignmentGroup};
use crate::labels::PACKLEFT_FINALIZER;
use crate::metrics;
use crate::patch::node_patch;
use crate::queues::RetryingWorkQueue;
use crate::reconcilers::finalizers::{ensure_cluster_finalizer, remove_cluster_finalizer};
use crate::reconcilers::retry::chain_is_not_found;
use crate::selector::targetable_labels_differ;
use crate::watcher::{NagController, NodeController, PodController};

use balance::{
    avoid_count, classify, has_packleft_attributes, node_can_be_balanced, percent_full, rank,
    with_packleft_state, without_packleft_state,
};

/// Listens for node, pod, and `NodeAssignmentGroup` events and rebalances
/// pack-left assignments.
pub struct PackLeftController {
    queue: Arc<RetryingWorkQueue<NodeAssignmentGroup>>,
    ctx: Arc<Context>,
}

impl PackLeftController {
    #[must_use]
    pub fn new(ctx: Arc<Context>, threadiness: usize) -> Self {
        Self {
            queue: Arc::new(RetryingWorkQueue::new(
                "PackLeftNodeAssignmentGroup",
                ctx.stores.nags.clone(),
                threadiness,
            )),
            ctx,
        }
    }

    /// Start the queue workers.
    pub fn run(&self) {
        let ctx = self.ctx.clone();
        self.queue.run(move |nag| {
            let ctx = ctx.clone();
            async move {
                let start = Instant::now();
                let result = reconcile_packleft(&ctx, &nag).await;
                match &result {
                    Ok(()) => metrics::record_reconciliation_success(
                        KIND_NODE_ASSIGNMENT_GROUP,
                        start.elapsed(),
                    ),
                    Err(_) => {
                        metrics::record_reconciliation_error(
                            KIND_NODE_ASSIGNMENT_GROUP,
                            start.elapsed(),
                        );
                        metrics::record_error(KIND_NODE_ASSIGNMENT_GROUP, "packleft_error");
                    }
                }
                result
            }
        });
    }

    /// Stop the queue workers.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    fn queue_all_nags(&self) {
        for nag in self.ctx.stores.nags.state() {
            self.queue.add(&nag);
        }
    }

    /// Queue every group that targets the node into a pack-left assignment.
    fn queue_nags_for_node(&self, node: &Node) {
        for nag in self.ctx.stores.nags_targeting_node(node) {
            if node_has_packleft_assignment(node, &nag) {
                self.queue.add(&nag);
            }
        }
    }

    /// Queue the groups affected by a pod on whichever node hosts it.
    fn queue_nags_for_pod(&self, pod: &Pod) {
        if let Some(node) = self.ctx.stores.node_hosting_pod(pod) {
            self.queue_nags_for_node(&node);
        }
    }
}

impl NagController for PackLeftController {
    fn on_add_nag(&self, nag: &NodeAssignmentGroup) {
        debug!("PackLeft: adding nag {} to queue", nag.name_any());
        self.queue.add(nag);
    }

    fn on_update_nag(&self, _old: &NodeAssignmentGroup, new: &NodeAssignmentGroup) {
        debug!("PackLeft: adding nag {} to queue", new.name_any());
        self.queue.add(new);
    }

    fn on_delete_nag(&self, nag: &NodeAssignmentGroup) {
        debug!("PackLeft: adding deleted nag {} to queue", nag.name_any());
        self.queue.add(nag);
    }
}

impl NodeController for PackLeftController {
    fn on_add_node(&self, node: &Node) {
        debug!(
            "PackLeft: node {} added or workload changed. Requeueing all nags",
            node.name_any()
        );
        self.queue_all_nags();
    }

    fn on_update_node(&self, old: &Node, new: &Node) {
        let old_labels = old.metadata.labels.clone().unwrap_or_default();
        let new_labels = new.metadata.labels.clone().unwrap_or_default();
        if targetable_labels_differ(&old_labels, &new_labels)
            || node_can_be_balanced(old) != node_can_be_balanced(new)
        {
            debug!(
                "PackLeft: node {} has updated balancing attributes. Requeueing all nags",
                new.name_any()
            );
            self.queue_all_nags();
        }
    }

    fn on_delete_node(&self, node: &Node) {
        self.queue_nags_for_node(node);
    }
}

impl PodController for PackLeftController {
    fn on_add_pod(&self, pod: &Pod) {
        // A brand-new pod may not be bound yet; the update that binds it
        // triggers the rebalance below
        self.queue_nags_for_pod(pod);
    }

    fn on_update_pod(&self, old: &Pod, new: &Pod) {
        // Pods never move nodes, but they do go from no node to a node
        let old_node = old.spec.as_ref().and_then(|s| s.node_name.as_deref());
        let new_node = new.spec.as_ref().and_then(|s| s.node_name.as_deref());
        if old_node != new_node {
            self.queue_all_nags();
        }
    }

    fn on_delete_pod(&self, pod: &Pod) {
        self.queue_nags_for_pod(pod);
    }
}

/// Whether the node is assigned to one of the group's pack-left assignments.
#[must_use]
pub fn node_has_packleft_assignment(node: &Node, nag: &NodeAssignmentGroup) -> bool {
    nag.assignment_of(node)
        .and_then(|name| nag.find_assignment(&name).cloned())
        .is_some_and(|a| a.is_pack_left())
}

/// Rebalance a group's pack-left assignments, or tear the pack-left
/// attributes down when the group is being deleted.
///
/// # Errors
///
/// Returns an error on API failures so the queue retries.
pub async fn reconcile_packleft(ctx: &Context, nag: &NodeAssignmentGroup) -> Result<()> {
    debug!("Processing pack-left for nag {}", nag.name_any());

    let gauge = metrics::packleft_full_percent(&nag.name_any());
    gauge.reset();

    if nag.metadata.deletion_timestamp.is_some() {
        clean_all_nodes(ctx, nag).await?;
        return remove_cluster_finalizer(&ctx.client, nag, PACKLEFT_FINALIZER).await;
    }

    match ensure_cluster_finalizer(&ctx.client, nag, PACKLEFT_FINALIZER).await {
        Ok(_) => {}
        // Group already gone; the delete event follows with its own snapshot
        Err(e) if chain_is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e),
    }

    rebalance_nag(ctx, nag, &gauge).await?;
    clean_unassigned_nodes(ctx, nag).await?;

    Ok(())
}

/// Rebalance every pack-left assignment in the group.
async fn rebalance_nag(
    ctx: &Context,
    nag: &NodeAssignmentGroup,
    gauge: &prometheus::GaugeVec,
) -> Result<()> {
    let groups = packleft_node_groups(ctx, nag);
    debug!(
        "found {} pack-left node group(s) for nag {}",
        groups.len(),
        nag.name_any()
    );

    for (assignment_name, nodes) in groups {
        let Some(assignment) = nag.find_assignment(&assignment_name).cloned() else {
            warn!(
                "Assignment {} doesn't exist in nag {}",
                assignment_name,
                nag.name_any()
            );
            continue;
        };
        if nodes.is_empty() {
            warn!(
                "No nodes found for assignment {} on nag {}",
                assignment_name,
                nag.name_any()
            );
            continue;
        }
        info!(
            "rebalancing {} node(s) in assignment {}.{}",
            nodes.len(),
            nag.name_any(),
            assignment_name
        );
        balance_nodes(ctx, nag, &assignment, &nodes, gauge).await?;
    }

    Ok(())
}

/// Map of assignment name to the targeted nodes currently carrying it, for
/// pack-left assignments only.
fn packleft_node_groups(ctx: &Context, nag: &NodeAssignmentGroup) -> Vec<(String, Vec<Node>)> {
    let mut groups: Vec<(String, Vec<Node>)> = Vec::new();
    for node in ctx.stores.nodes.state() {
        if !nag.targets_node(&node) {
            continue;
        }
        let Some(assignment_name) = nag.assignment_of(&node) else {
            continue;
        };
        let is_packleft = nag
            .find_assignment(&assignment_name)
            .is_some_and(NodeAssignment::is_pack_left);
        if !is_packleft {
            continue;
        }
        match groups.iter_mut().find(|(name, _)| *name == assignment_name) {
            Some((_, nodes)) => nodes.push((*node).clone()),
            None => groups.push((assignment_name, vec![(*node).clone()])),
        }
    }
    groups
}

/// Classify one assignment's nodes and patch their labels and taints.
async fn balance_nodes(
    ctx: &Context,
    nag: &NodeAssignmentGroup,
    assignment: &NodeAssignment,
    nodes: &[Node],
    gauge: &prometheus::GaugeVec,
) -> Result<()> {
    let label_key = nag.packleft_label_key();

    let mut ranked: Vec<(f64, Node)> = Vec::new();
    for node in nodes {
        if !node_can_be_balanced(node) {
            continue;
        }
        let node_pods: Vec<Pod> = ctx
            .stores
            .pods_on_node(&node.name_any())
            .iter()
            .map(|p| (**p).clone())
            .collect();
        ranked.push((percent_full(node, &node_pods), node.clone()));
    }

    if ranked.is_empty() {
        warn!("No schedulable nodes found. Unable to balance nodes");
        return Ok(());
    }

    rank(&mut ranked);

    // The avoid buffer is sized against the whole assignment, not just the
    // momentarily balanceable nodes
    let avoid_buffer = assignment.avoid_buffer(nodes.len());
    let full_fraction = assignment.full_fraction();
    debug!(
        "attempting to leave {} node(s) as 'Avoid'; nodes are full at {}%",
        avoid_buffer,
        full_fraction * 100.0
    );

    let classified = classify(&ranked, full_fraction, avoid_buffer);

    for (fullness, node, state) in &classified {
        let node_name = node.name_any();
        gauge
            .with_label_values(&[assignment.name.as_str(), node_name.as_str(), state.as_str()])
            .set(*fullness);
        debug!("assigned node {} to be {}", node.name_any(), state.as_str());
        let desired = with_packleft_state(node, &label_key, *state);
        patch_node(ctx, node, &desired).await?;
    }

    let realized = avoid_count(&classified);
    if realized != avoid_buffer {
        warn!(
            "avoid buffer size on {}.{} is lower than specified",
            nag.name_any(),
            assignment.name
        );
    }

    Ok(())
}

/// Strip pack-left attributes from nodes that still carry them but are no
/// longer in any pack-left assignment of the group.
async fn clean_unassigned_nodes(ctx: &Context, nag: &NodeAssignmentGroup) -> Result<()> {
    let label_key = nag.packleft_label_key();
    for node in ctx.stores.nodes.state() {
        if !node_has_packleft_assignment(&node, nag) && has_packleft_attributes(&node, &label_key) {
            debug!(
                "Node {} has pack-left attributes for nag {} but is not assigned to it anymore. Clearing",
                node.name_any(),
                nag.name_any()
            );
            let desired = without_packleft_state(&node, &label_key);
            patch_node(ctx, &node, &desired).await?;
        }
    }
    Ok(())
}

/// Deletion path: strip pack-left attributes from every node carrying them.
async fn clean_all_nodes(ctx: &Context, nag: &NodeAssignmentGroup) -> Result<()> {
    info!("Cleaning pack-left attributes for nag {}", nag.name_any());
    let label_key = nag.packleft_label_key();
    for node in ctx.stores.nodes.state() {
        if has_packleft_attributes(&node, &label_key) {
            let desired = without_packleft_state(&node, &label_key);
            patch_node(ctx, &node, &desired).await?;
        }
    }
    Ok(())
}

async fn patch_node(ctx: &Context, old: &Node, new: &Node) -> Result<()> {
    if let Some(patch) = node_patch(old, new) {
        let nodes_api: Api<Node> = Api::all(ctx.client.clone());
        nodes_api
            .patch(&old.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
