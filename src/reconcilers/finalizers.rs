// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Finalizer management for cluster-scoped resources.
//!
//! Finalizer edits are read-modify-write with optimistic concurrency: each
//! attempt re-reads the entity, edits the finalizer list, and patches with
//! the observed `resourceVersion` so a concurrent mutator forces a retry
//! rather than a lost update.

use anyhow::Result;
use kube::api::{Patch, PatchParams};
use kube::core::ClusterResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::info;

use super::retry::retry_on_conflict;

/// Add a finalizer to a cluster-scoped resource if not already present.
///
/// Returns `true` when the finalizer was added. The caller can use this to
/// skip the rest of its reconcile: the resulting update event re-enqueues the
/// entity, so reconciling twice would be redundant.
///
/// # Errors
///
/// Returns an error when the API read or patch fails after the conflict
/// budget is spent.
pub async fn ensure_cluster_finalizer<K>(
    client: &Client,
    resource: &K,
    finalizer: &str,
) -> Result<bool>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + DeserializeOwned,
{
    if resource.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }

    let name = resource.name_any();
    let api: Api<K> = Api::all(client.clone());

    retry_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        async move {
            let latest = api.get(&name).await?;
            if latest.finalizers().iter().any(|f| f == finalizer) {
                return Ok(());
            }
            let mut finalizers = latest.finalizers().to_vec();
            finalizers.push(finalizer.to_string());
            let patch = json!({
                "metadata": {
                    "resourceVersion": latest.resource_version(),
                    "finalizers": finalizers,
                }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
    })
    .await?;

    info!(
        "Added finalizer {} to {} {}",
        finalizer,
        K::kind(&()),
        name
    );
    Ok(true)
}

/// Remove a finalizer from a cluster-scoped resource.
///
/// Idempotent: a missing finalizer, or an entity already gone from the API,
/// is a successful no-op.
///
/// # Errors
///
/// Returns an error when the API read or patch fails after the conflict
/// budget is spent.
pub async fn remove_cluster_finalizer<K>(
    client: &Client,
    resource: &K,
    finalizer: &str,
) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + DeserializeOwned,
{
    let name = resource.name_any();
    let api: Api<K> = Api::all(client.clone());

    let result = retry_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        async move {
            let latest = api.get(&name).await?;
            if !latest.finalizers().iter().any(|f| f == finalizer) {
                return Ok(());
            }
            let finalizers: Vec<String> = latest
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != finalizer)
                .cloned()
                .collect();
            let patch = json!({
                "metadata": {
                    "resourceVersion": latest.resource_version(),
                    "finalizers": finalizers,
                }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
    })
    .await;

    match result {
        Ok(()) => {
            info!(
                "Removed finalizer {} from {} {}",
                finalizer,
                K::kind(&()),
                name
            );
            Ok(())
        }
        // Entity already purged; nothing left to release
        Err(e) if super::retry::is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
