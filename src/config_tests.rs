// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for environment-driven configuration.

use super::*;
use std::sync::Mutex;

// The environment is process-global; serialize tests that touch it
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_valet_env() {
    for (key, _) in env::vars() {
        if key.starts_with("KUBE_VALET_") {
            env::remove_var(&key);
        }
    }
}

#[test]
fn test_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_valet_env();

    let config = ValetConfig::load().unwrap();

    assert!(config.nag_controller.enabled);
    assert!(config.packleft_controller.enabled);
    assert!(config.pod_controller.enabled);
    assert_eq!(config.nag_controller.threadiness, 1);
    assert_eq!(config.packleft_controller.threadiness, 1);
    assert_eq!(config.pod_controller.threadiness, 1);
    assert_eq!(config.webhook.listen, "0.0.0.0:8443");
    assert!(config.leader_election.enabled);
    assert_eq!(config.leader_election.lock_name, "kube-valet-election");
    assert_eq!(config.leader_election.lease_duration_secs, 30);
    assert_eq!(config.leader_election.retry_period_secs, 2);
    assert!(!config.leader_election.identity.is_empty());
}

#[test]
fn test_controllers_can_be_disabled_independently() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_valet_env();

    env::set_var("KUBE_VALET_NODE_ASSIGNMENT", "false");
    env::set_var("KUBE_VALET_SCHEDULING_PACKLEFT", "false");

    let config = ValetConfig::load().unwrap();
    assert!(!config.nag_controller.enabled);
    assert!(!config.packleft_controller.enabled);
    assert!(config.pod_controller.enabled);

    clear_valet_env();
}

#[test]
fn test_threadiness_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_valet_env();

    env::set_var("KUBE_VALET_NUM_POD_THREADS", "4");

    let config = ValetConfig::load().unwrap();
    assert_eq!(config.pod_controller.threadiness, 4);

    clear_valet_env();
}

#[test]
fn test_unparseable_value_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_valet_env();

    env::set_var("KUBE_VALET_LEADER_ELECT", "not-a-bool");
    assert!(ValetConfig::load().is_err());

    clear_valet_env();
}

#[test]
fn test_webhook_tls_paths_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_valet_env();

    env::set_var("KUBE_VALET_TLS_CERT_PATH", "/tmp/test.crt");
    env::set_var("KUBE_VALET_TLS_KEY_PATH", "/tmp/test.key");

    let config = ValetConfig::load().unwrap();
    assert_eq!(config.webhook.tls_cert_path, "/tmp/test.crt");
    assert_eq!(config.webhook.tls_key_path, "/tmp/test.key");

    clear_valet_env();
}
