// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Two-way merge patch construction.
//!
//! All cluster mutations flow through patches computed between an old and a
//! new snapshot of the same entity. Building the patch from a locally
//! consistent pair guarantees no foreign field is ever overwritten, and
//! suppressing empty patches makes reconciliation idempotent: a second run
//! over unchanged inputs sends nothing.

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde_json::{json, Map, Value};

/// Build a merge patch moving a node from `old` to `new`, covering the labels
/// and taints the reconcilers manage.
///
/// Changed label keys are set, removed keys are nulled, and the taint list is
/// replaced wholesale when it differs - a single patch therefore swaps an
/// assignment's label and taint atomically.
///
/// Returns `None` when the two snapshots are identical in both fields.
#[must_use]
pub fn node_patch(old: &Node, new: &Node) -> Option<Value> {
    let mut patch = Map::new();

    let empty = Default::default();
    let old_labels = old.metadata.labels.as_ref().unwrap_or(&empty);
    let new_labels = new.metadata.labels.as_ref().unwrap_or(&empty);

    let mut label_changes = Map::new();
    for (k, v) in new_labels {
        if old_labels.get(k) != Some(v) {
            label_changes.insert(k.clone(), Value::String(v.clone()));
        }
    }
    for k in old_labels.keys() {
        if !new_labels.contains_key(k) {
            label_changes.insert(k.clone(), Value::Null);
        }
    }
    if !label_changes.is_empty() {
        patch.insert(
            "metadata".to_string(),
            json!({ "labels": Value::Object(label_changes) }),
        );
    }

    let old_taints = old.spec.as_ref().and_then(|s| s.taints.as_ref());
    let new_taints = new.spec.as_ref().and_then(|s| s.taints.as_ref());
    if old_taints != new_taints {
        let taints = new_taints.cloned().unwrap_or_default();
        patch.insert("spec".to_string(), json!({ "taints": taints }));
    }

    if patch.is_empty() {
        None
    } else {
        Some(Value::Object(patch))
    }
}

/// Build a merge patch moving a pod's scheduling fields from `old` to `new`.
///
/// Covers `nodeSelector`, `affinity`, and `tolerations` only. Returns `None`
/// when nothing changed.
#[must_use]
pub fn pod_scheduling_patch(old: &Pod, new: &Pod) -> Option<Value> {
    let old_spec = old.spec.clone().unwrap_or_default();
    let new_spec = new.spec.clone().unwrap_or_default();

    let mut spec_changes = Map::new();
    if old_spec.node_selector != new_spec.node_selector {
        spec_changes.insert(
            "nodeSelector".to_string(),
            serde_json::to_value(&new_spec.node_selector).unwrap_or(Value::Null),
        );
    }
    if old_spec.affinity != new_spec.affinity {
        spec_changes.insert(
            "affinity".to_string(),
            serde_json::to_value(&new_spec.affinity).unwrap_or(Value::Null),
        );
    }
    if old_spec.tolerations != new_spec.tolerations {
        spec_changes.insert(
            "tolerations".to_string(),
            serde_json::to_value(&new_spec.tolerations).unwrap_or(Value::Null),
        );
    }

    if spec_changes.is_empty() {
        None
    } else {
        Some(json!({ "spec": Value::Object(spec_changes) }))
    }
}

/// Compute the minimal JSON Patch (RFC 6902) moving `old` to `new`.
///
/// This is the body shape a mutating admission response carries.
///
/// # Errors
///
/// Returns an error if either pod fails to serialize.
pub fn pod_json_patch(old: &Pod, new: &Pod) -> Result<json_patch::Patch> {
    let old_value = serde_json::to_value(old)?;
    let new_value = serde_json::to_value(new)?;
    Ok(json_patch::diff(&old_value, &new_value))
}

#[cfg(test)]
#[path = "patch_tests.rs"]
mod patch_tests;
