// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Process configuration.
//!
//! All configuration is environment-variable driven (`KUBE_VALET_*`). Each
//! reconciler can be switched off independently; the admission webhook always
//! runs so that pod mutation keeps working across leadership changes.

use std::env;

use crate::constants::{
    DEFAULT_ELECTION_LOCK_NAME, DEFAULT_ELECTION_NAMESPACE, DEFAULT_LEASE_DURATION_SECS,
    DEFAULT_LEASE_RETRY_PERIOD_SECS, DEFAULT_TLS_CERT_PATH, DEFAULT_TLS_KEY_PATH,
    DEFAULT_WEBHOOK_LISTEN,
};

/// Top-level configuration for the controller process.
#[derive(Clone, Debug)]
pub struct ValetConfig {
    /// Node assignment reconciler settings
    pub nag_controller: ControllerConfig,
    /// Pack-left balancer settings
    pub packleft_controller: ControllerConfig,
    /// Pod assignment controller settings
    pub pod_controller: ControllerConfig,
    /// Admission webhook settings
    pub webhook: WebhookConfig,
    /// Leader election settings
    pub leader_election: LeaderElectionConfig,
}

/// Per-reconciler settings.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Whether this reconciler runs when the process holds leadership
    pub enabled: bool,
    /// Number of queue workers
    pub threadiness: usize,
}

/// Admission webhook settings.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Listen address, e.g. `0.0.0.0:8443`
    pub listen: String,
    /// Path to the PEM-encoded serving certificate
    pub tls_cert_path: String,
    /// Path to the PEM-encoded private key
    pub tls_key_path: String,
}

/// Leader election settings.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    /// Name of the lock resource
    pub lock_name: String,
    /// Namespace the lock resource lives in
    pub lock_namespace: String,
    /// Unique identity of this candidate
    pub identity: String,
    /// Seconds non-leaders wait before attempting to acquire
    pub lease_duration_secs: u64,
    /// Seconds between acquisition and renewal attempts
    pub retry_period_secs: u64,
}

impl ValetConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is present but unparseable; a missing
    /// value falls back to its default.
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self {
            nag_controller: ControllerConfig {
                enabled: env_bool("KUBE_VALET_NODE_ASSIGNMENT", true)?,
                threadiness: env_usize("KUBE_VALET_NUM_NAG_THREADS", 1)?,
            },
            packleft_controller: ControllerConfig {
                enabled: env_bool("KUBE_VALET_SCHEDULING_PACKLEFT", true)?,
                threadiness: env_usize("KUBE_VALET_NUM_PACKLEFT_THREADS", 1)?,
            },
            pod_controller: ControllerConfig {
                enabled: env_bool("KUBE_VALET_POD_ASSIGNMENT", true)?,
                threadiness: env_usize("KUBE_VALET_NUM_POD_THREADS", 1)?,
            },
            webhook: WebhookConfig {
                listen: env_or("KUBE_VALET_WEBHOOK_LISTEN", DEFAULT_WEBHOOK_LISTEN),
                tls_cert_path: env_or("KUBE_VALET_TLS_CERT_PATH", DEFAULT_TLS_CERT_PATH),
                tls_key_path: env_or("KUBE_VALET_TLS_KEY_PATH", DEFAULT_TLS_KEY_PATH),
            },
            leader_election: LeaderElectionConfig {
                enabled: env_bool("KUBE_VALET_LEADER_ELECT", true)?,
                lock_name: env_or("KUBE_VALET_LOCK_NAME", DEFAULT_ELECTION_LOCK_NAME),
                lock_namespace: env::var("KUBE_VALET_LOCK_NAMESPACE")
                    .or_else(|_| env::var("POD_NAMESPACE"))
                    .unwrap_or_else(|_| DEFAULT_ELECTION_NAMESPACE.to_string()),
                identity: env::var("KUBE_VALET_LEADER_ELECT_ID")
                    .or_else(|_| env::var("POD_NAME"))
                    .or_else(|_| env::var("HOSTNAME"))
                    .unwrap_or_else(|_| format!("kube-valet-{}", rand::random::<u32>())),
                lease_duration_secs: env_u64(
                    "KUBE_VALET_LEASE_DURATION_SECONDS",
                    DEFAULT_LEASE_DURATION_SECS,
                )?,
                retry_period_secs: env_u64(
                    "KUBE_VALET_LEASE_RETRY_PERIOD_SECONDS",
                    DEFAULT_LEASE_RETRY_PERIOD_SECS,
                )?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> anyhow::Result<bool> {
    match env::var(key) {
        Ok(v) => v
            .parse::<bool>()
            .map_err(|_| anyhow::anyhow!("{key} must be true or false, got {v:?}")),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> anyhow::Result<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|_| anyhow::anyhow!("{key} must be a positive integer, got {v:?}")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("{key} must be a positive integer, got {v:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
