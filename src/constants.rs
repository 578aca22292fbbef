// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Global constants for the kube-valet controller.
//!
//! Numeric and string constants used throughout the codebase, organized by
//! category.

// ============================================================================
// API Constants
// ============================================================================

/// Root domain for all kube-valet keys
pub const DOMAIN: &str = "kube-valet.io";

/// API group for all kube-valet CRDs
pub const API_GROUP: &str = "assignments.kube-valet.io";

/// API version for all kube-valet CRDs
pub const API_VERSION: &str = "v1alpha1";

/// Kind name for the `NodeAssignmentGroup` resource
pub const KIND_NODE_ASSIGNMENT_GROUP: &str = "NodeAssignmentGroup";

/// Kind name for the `PodAssignmentRule` resource
pub const KIND_POD_ASSIGNMENT_RULE: &str = "PodAssignmentRule";

/// Kind name for the `ClusterPodAssignmentRule` resource
pub const KIND_CLUSTER_POD_ASSIGNMENT_RULE: &str = "ClusterPodAssignmentRule";

/// Kind label used when recording pod queue metrics
pub const KIND_POD: &str = "Pod";

// ============================================================================
// Taint Effects
// ============================================================================

/// Default taint effect applied when an assignment taints but does not
/// specify an effect
pub const TAINT_EFFECT_NO_SCHEDULE: &str = "NoSchedule";

/// Taint effect applied to pack-left `Avoid` nodes
pub const TAINT_EFFECT_PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";

// ============================================================================
// Pack-Left Defaults
// ============================================================================

/// Percent of requested-to-allocatable usage at which a node is considered
/// full, when the assignment does not override it
pub const DEFAULT_FULL_PERCENT: i32 = 80;

/// Minimum number of nodes held in the `Avoid` buffer
pub const MIN_AVOID_BUFFER: usize = 1;

// ============================================================================
// Work Queue Constants
// ============================================================================

/// Number of times a key is retried before it is dropped from a queue
pub const MAX_QUEUE_RETRIES: u32 = 5;

/// Base delay for per-key retry backoff
pub const QUEUE_BASE_DELAY_MILLIS: u64 = 5;

/// Upper bound for per-key retry backoff
pub const QUEUE_MAX_DELAY_SECS: u64 = 1000;

// ============================================================================
// Startup Constants
// ============================================================================

/// Number of worker threads for the Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

/// How long to wait for a cache to sync before aborting startup
pub const CACHE_SYNC_TIMEOUT_SECS: u64 = 60;

/// Delay before restarting the webhook listener after a serve error
pub const WEBHOOK_RESTART_DELAY_SECS: u64 = 3;

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Default name of the election lock resource
pub const DEFAULT_ELECTION_LOCK_NAME: &str = "kube-valet-election";

/// Default namespace for the election lock resource
pub const DEFAULT_ELECTION_NAMESPACE: &str = "kube-system";

/// Default leader election lease duration (seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 30;

/// Default leader election retry period (seconds)
pub const DEFAULT_LEASE_RETRY_PERIOD_SECS: u64 = 2;

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Port for the Prometheus metrics HTTP server
pub const METRICS_SERVER_PORT: u16 = 8080;

/// Path for the Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Bind address for the metrics HTTP server
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";

// ============================================================================
// Webhook Constants
// ============================================================================

/// Default listen address for the mutating admission webhook
pub const DEFAULT_WEBHOOK_LISTEN: &str = "0.0.0.0:8443";

/// Default path to the webhook TLS certificate
pub const DEFAULT_TLS_CERT_PATH: &str = "/etc/kube-valet/certs/tls.crt";

/// Default path to the webhook TLS private key
pub const DEFAULT_TLS_KEY_PATH: &str = "/etc/kube-valet/certs/tls.key";
