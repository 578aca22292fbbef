// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the kube-valet controller.
//!
//! All metrics are registered in a process-wide registry and exposed on the
//! `/metrics` endpoint.
//!
//! The pack-left fullness gauge is special: one `GaugeVec` is lazily created
//! and registered per `NodeAssignmentGroup`, carrying the group name as a
//! constant label. The balancer resets the group's gauge at the start of each
//! reconcile and emits one sample per classified node.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

/// Namespace prefix for all kube-valet metrics
const METRICS_NAMESPACE: &str = "kubevalet";

/// Global Prometheus metrics registry
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliations by resource type and outcome
///
/// Labels:
/// - `resource_type`: Kind being reconciled (e.g. `NodeAssignmentGroup`)
/// - `status`: `success` or `error`
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of reconciliations by resource type and status",
    );
    let counter = CounterVec::new(opts, &["resource_type", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliations in seconds by resource type
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of reconciliations in seconds by resource type",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["resource_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Total number of errors by resource type and error category
pub static ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_errors_total"),
        "Total number of errors by resource type and error category",
    );
    let counter = CounterVec::new(opts, &["resource_type", "error_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Leader Election Metrics
// ============================================================================

/// Current leadership status (1 = leader, 0 = follower)
pub static LEADER_STATUS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_status"),
        "Current leader election status (1 = leader, 0 = follower)",
    );
    let gauge = GaugeVec::new(opts, &["identity"]).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Pack-Left Fullness
// ============================================================================

static PACKLEFT_FULL_PERCENT: LazyLock<Mutex<HashMap<String, GaugeVec>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Fetch (lazily creating and registering) the pack-left fullness gauge for a
/// group.
///
/// The gauge is named `kubevalet_packleft_full_percent`, carries the group
/// name as the constant label `node_assignment_group`, and is sampled with
/// labels `{node_assignment, node_name, pack_left_state}`.
#[must_use]
pub fn packleft_full_percent(nag_name: &str) -> GaugeVec {
    let mut by_nag = PACKLEFT_FULL_PERCENT
        .lock()
        .expect("packleft gauge map poisoned");
    by_nag
        .entry(nag_name.to_string())
        .or_insert_with(|| {
            let opts = Opts::new(
                format!("{METRICS_NAMESPACE}_packleft_full_percent"),
                "Requested-to-allocatable fullness of pack-left nodes",
            )
            .const_label("node_assignment_group", nag_name);
            let gauge =
                GaugeVec::new(opts, &["node_assignment", "node_name", "pack_left_state"]).unwrap();
            METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
            gauge
        })
        .clone()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a successful reconciliation.
pub fn record_reconciliation_success(resource_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "success"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[resource_type])
        .observe(duration.as_secs_f64());
}

/// Record a failed reconciliation.
pub fn record_reconciliation_error(resource_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "error"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[resource_type])
        .observe(duration.as_secs_f64());
}

/// Record an error by category.
pub fn record_error(resource_type: &str, error_type: &str) {
    ERRORS_TOTAL
        .with_label_values(&[resource_type, error_type])
        .inc();
}

/// Record leadership acquisition.
pub fn record_leader_elected(identity: &str) {
    LEADER_STATUS.with_label_values(&[identity]).set(1.0);
}

/// Record leadership loss.
pub fn record_leader_lost(identity: &str) {
    LEADER_STATUS.with_label_values(&[identity]).set(0.0);
}

/// Gather and encode all metrics in the Prometheus text format.
///
/// # Errors
/// Returns an error if encoding fails.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packleft_gauge_is_registered_once_per_group() {
        let first = packleft_full_percent("metrics-test-group");
        let second = packleft_full_percent("metrics-test-group");

        first
            .with_label_values(&["a", "n1", "Use"])
            .set(0.9);

        // Both handles observe the same underlying vector
        assert!(
            (second.with_label_values(&["a", "n1", "Use"]).get() - 0.9).abs() < f64::EPSILON
        );
    }

    #[test]
    fn test_packleft_gauge_reset_clears_samples() {
        let gauge = packleft_full_percent("metrics-reset-group");
        gauge.with_label_values(&["a", "n1", "Deny"]).set(0.1);
        gauge.reset();
        // After a reset the vector reports no samples until re-emitted
        assert_eq!(gauge.with_label_values(&["a", "n1", "Deny"]).get(), 0.0);
    }

    #[test]
    fn test_gather_metrics_contains_namespace() {
        record_reconciliation_success("GatherTest", Duration::from_millis(100));
        let text = gather_metrics().unwrap();
        assert!(text.contains("kubevalet"));
        assert!(text.contains("reconciliations_total"));
    }
}
