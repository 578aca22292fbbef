// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Pod assignment: scheduling-constraint injection from assignment rules.
//!
//! The admission webhook is the primary mutation path: it calls
//! [`mutate_pod`] against the rule caches at request time. The elected pod
//! controller backstops it, patching scheduling onto unprotected pods that
//! were admitted unmutated (for example while the webhook was unreachable)
//! and have not been bound to a node yet.
//!
//! Rule ordering is deterministic: every matching cluster rule sorted by
//! name, then every matching namespaced rule sorted by name. Rules apply in
//! that order and the last non-empty rule wins per field, so namespaced
//! rules take precedence over cluster rules where they overlap.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::debug;

use crate::constants::KIND_POD;
use crate::context::{Context, Stores};
use crate::crd::{pod_is_protected, PodAssignmentRuleScheduling};
use crate::metrics;
use crate::patch::pod_scheduling_patch;
use crate::queues::RetryingWorkQueue;
use crate::reconcilers::retry::is_not_found;
use crate::watcher::PodController;

/// Collect the scheduling blocks of every rule matching the pod, in
/// application order.
#[must_use]
pub fn collect_scheduling(stores: &Stores, pod: &Pod) -> Vec<PodAssignmentRuleScheduling> {
    let mut scheduling = Vec::new();

    // Cluster-scoped rules first, sorted by name for a stable merge order
    let mut cpars = stores.cpars.state();
    cpars.sort_by_key(|r| r.name_any());
    for rule in cpars {
        if rule.targets_pod(pod) {
            scheduling.push(rule.spec.scheduling.clone());
        }
    }

    // Then namespaced rules from the pod's namespace, sorted by name
    let namespace = pod.namespace().unwrap_or_default();
    let mut pars: Vec<_> = stores
        .pars
        .state()
        .into_iter()
        .filter(|r| r.namespace().as_deref() == Some(namespace.as_str()))
        .collect();
    pars.sort_by_key(|r| r.name_any());
    for rule in pars {
        if rule.targets_pod(pod) {
            scheduling.push(rule.spec.scheduling.clone());
        }
    }

    scheduling
}

/// Compute the mutated shape of a pod under the current rule set.
///
/// Protected pods come back unchanged; otherwise every matching rule is
/// applied in order.
#[must_use]
pub fn mutate_pod(stores: &Stores, pod: &Pod) -> Pod {
    let mut mutated = pod.clone();

    if pod_is_protected(&mutated) {
        return mutated;
    }

    let scheduling = collect_scheduling(stores, &mutated);
    debug!(
        "Matched {} scheduling rule(s) for pod {}",
        scheduling.len(),
        mutated.name_any()
    );
    for s in &scheduling {
        s.apply_to_pod(&mut mutated);
    }

    mutated
}

/// Listens for pod events and applies assignment-rule scheduling to pods the
/// webhook did not mutate.
pub struct PodAssignmentController {
    queue: Arc<RetryingWorkQueue<Pod>>,
    ctx: Arc<Context>,
}

impl PodAssignmentController {
    #[must_use]
    pub fn new(ctx: Arc<Context>, threadiness: usize) -> Self {
        Self {
            queue: Arc::new(RetryingWorkQueue::new(
                "Pod",
                ctx.stores.pods.clone(),
                threadiness,
            )),
            ctx,
        }
    }

    /// Start the queue workers.
    pub fn run(&self) {
        let ctx = self.ctx.clone();
        self.queue.run(move |pod| {
            let ctx = ctx.clone();
            async move {
                let start = Instant::now();
                let result = reconcile_pod(&ctx, &pod).await;
                match &result {
                    Ok(()) => metrics::record_reconciliation_success(KIND_POD, start.elapsed()),
                    Err(_) => {
                        metrics::record_reconciliation_error(KIND_POD, start.elapsed());
                        metrics::record_error(KIND_POD, "reconcile_error");
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
}

impl PodController for PodAssignmentController {
    fn on_add_pod(&self, pod: &Pod) {
        self.queue.add(pod);
    }

    fn on_update_pod(&self, old: &Pod, new: &Pod) {
        if old.resource_version() != new.resource_version() || old.uid() != new.uid() {
            self.queue.add(new);
        }
    }

    fn on_delete_pod(&self, pod: &Pod) {
        self.queue.add(pod);
    }
}

/// Apply matching rule scheduling to a pod that is not protected and not yet
/// bound to a node.
///
/// Bound pods are skipped: the scheduling fields this controller manages are
/// immutable once the pod is placed.
///
/// # Errors
///
/// Returns an error on API failures so the queue retries; a pod that no
/// longer exists is a successful no-op.
pub async fn reconcile_pod(ctx: &Context, pod: &Pod) -> Result<()> {
    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }
    if pod_is_protected(pod) {
        return Ok(());
    }
    let bound = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some();
    if bound {
        return Ok(());
    }

    debug!("Processing scheduling rules for pod {}", pod.name_any());

    let mutated = mutate_pod(&ctx.stores, pod);
    let Some(patch) = pod_scheduling_patch(pod, &mutated) else {
        return Ok(());
    };

    let namespace = pod.namespace().unwrap_or_default();
    let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    match pods_api
        .patch(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        // Pod vanished between the event and the patch
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
