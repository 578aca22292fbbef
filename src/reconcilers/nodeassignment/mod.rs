// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Node assignment reconciliation.
//!
//! Watches `NodeAssignmentGroup`s and nodes, and brings node labels and
//! taints into conformance with each group's declared assignments. All
//! mutations are two-way merge patches computed from fresh snapshots, so a
//! repeated reconcile over unchanged state sends nothing.

pub mod plan;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use crate::constants::KIND_NODE_ASSIGNMENT_GROUP;
use crate::context::Context;
use crate::crd::NodeAssignmentGroup;
use crate::labels::NAG_FINALIZER;
use crate::metrics;
use crate::patch::node_patch;
use crate::queues::RetryingWorkQueue;
use crate::reconcilers::finalizers::{ensure_cluster_finalizer, remove_cluster_finalizer};
use crate::reconcilers::retry::{chain_is_not_found, is_not_found};
use crate::selector::targetable_labels_differ;
use crate::watcher::{NagController, NodeController};

use plan::build_plan;

/// Listens for `NodeAssignmentGroup` and node changes and reconciles node
/// assignments.
pub struct NodeAssignmentController {
    queue: Arc<RetryingWorkQueue<NodeAssignmentGroup>>,
    ctx: Arc<Context>,
}

impl NodeAssignmentController {
    #[must_use]
    pub fn new(ctx: Arc<Context>, threadiness: usize) -> Self {
        Self {
            queue: Arc::new(RetryingWorkQueue::new(
                "NodeAssignmentGroup",
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
                let result = reconcile_nag(&ctx, &nag).await;
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
                        metrics::record_error(KIND_NODE_ASSIGNMENT_GROUP, "reconcile_error");
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
}

impl NagController for NodeAssignmentController {
    fn on_add_nag(&self, nag: &NodeAssignmentGroup) {
        debug!("Adding nag {} to queue", nag.name_any());
        self.queue.add(nag);
    }

    fn on_update_nag(&self, old: &NodeAssignmentGroup, new: &NodeAssignmentGroup) {
        // Only queue when something actually changed
        if old.resource_version() != new.resource_version() || old.uid() != new.uid() {
            self.queue.add(new);
        }
    }

    fn on_delete_nag(&self, nag: &NodeAssignmentGroup) {
        debug!("Adding deleted nag {} to queue", nag.name_any());
        self.queue.add(nag);
    }
}

impl NodeController for NodeAssignmentController {
    fn on_add_node(&self, node: &Node) {
        debug!(
            "NodeAssignment: node {} added. Requeueing all nags",
            node.name_any()
        );
        self.queue_all_nags();
    }

    fn on_update_node(&self, old: &Node, new: &Node) {
        // Only trigger on targetable label changes; status churn would
        // otherwise requeue constantly
        let old_labels = old.metadata.labels.clone().unwrap_or_default();
        let new_labels = new.metadata.labels.clone().unwrap_or_default();
        if targetable_labels_differ(&old_labels, &new_labels) {
            debug!(
                "NodeAssignment: node {} has updated targetable attributes. Requeueing all nags",
                new.name_any()
            );
            self.queue_all_nags();
        }
    }

    fn on_delete_node(&self, node: &Node) {
        for nag in self.ctx.stores.nags_targeting_node(node) {
            self.queue.add(&nag);
        }
    }
}

/// Bring the cluster's node labels and taints into conformance with the
/// group, or tear everything down when the group is being deleted.
///
/// # Errors
///
/// Returns an error on API failures so the queue retries; a group that no
/// longer exists is a successful no-op.
pub async fn reconcile_nag(ctx: &Context, nag: &NodeAssignmentGroup) -> Result<()> {
    debug!("Sync/Add/Update for NodeAssignmentGroup {}", nag.name_any());

    if nag.metadata.deletion_timestamp.is_some() {
        return delete_nag(ctx, nag).await;
    }

    // A fresh finalizer patch triggers an update event that re-enqueues the
    // group; reconciling now would do the work twice
    match ensure_cluster_finalizer(&ctx.client, nag, NAG_FINALIZER).await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        // Group already gone; the delete event follows with its own snapshot
        Err(e) if chain_is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e),
    }

    info!("Reconciling assignments for nag {}", nag.name_any());

    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let nodes = nodes_api.list(&ListParams::default()).await?.items;

    let plan = build_plan(nag, &nodes);

    for node_patch_op in &plan.patches {
        if let Some(patch) = node_patch(&node_patch_op.old, &node_patch_op.new) {
            debug!("Patching node {}", node_patch_op.name);
            nodes_api
                .patch(
                    &node_patch_op.name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
        }
    }

    // Nodes unassigned in memory that no reassignment covered still carry
    // labels in the API; strip them from a fresh read
    for name in &plan.deferred_unassign {
        unassign_node_by_name(ctx, nag, name).await?;
    }

    update_status(ctx, nag, plan.num_matched).await?;

    Ok(())
}

/// Fetch the latest version of a node and remove the group's attributes.
async fn unassign_node_by_name(ctx: &Context, nag: &NodeAssignmentGroup, name: &str) -> Result<()> {
    debug!("Unassigning node {}", name);
    let nodes_api: Api<Node> = Api::all(ctx.client.clone());

    let node = match nodes_api.get(name).await {
        Ok(node) => node,
        // Node deleted mid-reconcile; nothing left to clean
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut cleaned = node.clone();
    nag.unassign(&mut cleaned);
    if let Some(patch) = node_patch(&node, &cleaned) {
        nodes_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

/// Deletion path: unassign every node in the cluster, unconditionally, then
/// release the finalizer.
///
/// The sweep ignores targeting so that deleting a group always removes every
/// trace of it, even from nodes that stopped matching long ago.
async fn delete_nag(ctx: &Context, nag: &NodeAssignmentGroup) -> Result<()> {
    info!("Unassigning all assignments from {}", nag.name_any());

    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let nodes = nodes_api.list(&ListParams::default()).await?.items;

    for node in &nodes {
        let mut cleaned = node.clone();
        nag.unassign(&mut cleaned);
        if let Some(patch) = node_patch(node, &cleaned) {
            nodes_api
                .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
    }

    remove_cluster_finalizer(&ctx.client, nag, NAG_FINALIZER).await
}

/// Record how many nodes the group currently targets.
async fn update_status(ctx: &Context, nag: &NodeAssignmentGroup, num_matched: i64) -> Result<()> {
    let api: Api<NodeAssignmentGroup> = Api::all(ctx.client.clone());
    let status = json!({ "status": { "numMatched": num_matched } });
    match api
        .patch_status(
            &nag.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await
    {
        Ok(_) => Ok(()),
        // Group deleted while we were reconciling; the delete event follows
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
