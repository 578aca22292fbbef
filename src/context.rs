// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Shared context for all controllers, holding the client and the reflector
//! stores.
//!
//! Every controller receives an `Arc<Context>`. The stores are read-only
//! snapshots of cluster state, populated by the resource watcher; anything
//! handed out of a store is behind an `Arc` and must be deep-copied before
//! mutation.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
use std::sync::Arc;

use crate::crd::{ClusterPodAssignmentRule, NodeAssignmentGroup, PodAssignmentRule};

/// Shared context passed to all controllers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,

    /// Reflector stores for every watched resource type
    pub stores: Stores,
}

/// Collection of the five reflector caches.
///
/// Each store is populated by a dedicated watch task and provides in-memory
/// access to resources without API calls.
#[derive(Clone)]
pub struct Stores {
    pub pods: Store<Pod>,
    pub nodes: Store<Node>,
    pub nags: Store<NodeAssignmentGroup>,
    pub pars: Store<PodAssignmentRule>,
    pub cpars: Store<ClusterPodAssignmentRule>,
}

impl Stores {
    /// The node currently hosting a pod, if the pod is bound and the node is
    /// cached.
    #[must_use]
    pub fn node_hosting_pod(&self, pod: &Pod) -> Option<Arc<Node>> {
        let node_name = pod.spec.as_ref()?.node_name.as_deref()?;
        self.nodes
            .state()
            .into_iter()
            .find(|n| n.name_any() == node_name)
    }

    /// All pods currently bound to the named node. Phase filtering is left
    /// to the caller.
    #[must_use]
    pub fn pods_on_node(&self, node_name: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
            })
            .collect()
    }

    /// Every cached `NodeAssignmentGroup` that targets the node.
    #[must_use]
    pub fn nags_targeting_node(&self, node: &Node) -> Vec<Arc<NodeAssignmentGroup>> {
        self.nags
            .state()
            .into_iter()
            .filter(|nag| nag.targets_node(node))
            .collect()
    }
}
