// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Label, taint, and finalizer key constants used across all reconcilers.
//!
//! Node assignment state is expressed entirely through labels and taints, so
//! every key written by the controller is defined here to keep the reconcilers
//! and the cleanup paths in agreement.

use crate::constants::{API_GROUP, DOMAIN};

// ============================================================================
// Node Protection
// ============================================================================

/// Label key that excludes a node from every `NodeAssignmentGroup`, regardless
/// of targeting. Protected nodes also have any existing assignment labels and
/// taints removed on the next reconcile.
pub const PROTECTED_NODE_LABEL_KEY: &str = "nags.kube-valet.io/protected";

/// Value that must be set on [`PROTECTED_NODE_LABEL_KEY`] for the node to be
/// protected.
pub const PROTECTED_LABEL_VALUE: &str = "true";

// ============================================================================
// Pod Protection
// ============================================================================

/// Label key that excludes a pod from all assignment rule mutation.
pub const PROTECTED_POD_LABEL_KEY: &str = "pod.initializer.kube-valet.io/protected";

/// Value that must be set on [`PROTECTED_POD_LABEL_KEY`] for the pod to be
/// protected.
pub const PROTECTED_POD_LABEL_VALUE: &str = "true";

// ============================================================================
// Finalizers
// ============================================================================

/// Finalizer owned by the node assignment reconciler. Blocks
/// `NodeAssignmentGroup` deletion until every node has been unassigned.
pub const NAG_FINALIZER: &str = "nag.finalizer.kube-valet.io";

/// Finalizer owned by the pack-left balancer. Blocks `NodeAssignmentGroup`
/// deletion until every node has been cleansed of pack-left attributes.
pub const PACKLEFT_FINALIZER: &str = "packleft.nag.finalizer.kube-valet.io";

// ============================================================================
// Key Builders
// ============================================================================

/// Build the assignment label/taint key for a group.
///
/// Ex: `nag.assignments.kube-valet.io/my-group`
#[must_use]
pub fn assignment_key(nag_name: &str) -> String {
    format!("nag.{API_GROUP}/{nag_name}")
}

/// Build the pack-left label/taint key for a group.
///
/// Ex: `nag.packleft.scheduling.kube-valet.io/my-group`
#[must_use]
pub fn packleft_key(nag_name: &str) -> String {
    format!("nag.packleft.scheduling.{DOMAIN}/{nag_name}")
}

#[cfg(test)]
#[path = "labels_tests.rs"]
mod labels_tests;
