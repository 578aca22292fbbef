// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for conflict retry helpers.

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "test".to_string(),
        reason: "Test".to_string(),
        code,
    })
}

#[test]
fn test_conflict_classification() {
    assert!(is_conflict(&api_error(409)));
    assert!(!is_conflict(&api_error(404)));
    assert!(!is_conflict(&api_error(500)));
}

#[test]
fn test_not_found_classification() {
    assert!(is_not_found(&api_error(404)));
    assert!(!is_not_found(&api_error(409)));
}

#[test]
fn test_chain_not_found_sees_through_context() {
    let err = anyhow::Error::from(api_error(404)).context("fetching latest group");
    assert!(chain_is_not_found(&err));

    let other = anyhow::Error::from(api_error(409));
    assert!(!chain_is_not_found(&other));

    let unrelated = anyhow::anyhow!("no kube error here");
    assert!(!chain_is_not_found(&unrelated));
}

#[tokio::test]
async fn test_retry_on_conflict_retries_conflicts() {
    let attempts = AtomicU32::new(0);

    let result = retry_on_conflict(|| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(api_error(409))
            } else {
                Ok("done")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_on_conflict_gives_up_after_budget() {
    let attempts = AtomicU32::new(0);

    let result: Result<(), kube::Error> = retry_on_conflict(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(api_error(409)) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_retry_on_conflict_fails_fast_on_other_errors() {
    let attempts = AtomicU32::new(0);

    let result: Result<(), kube::Error> = retry_on_conflict(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(api_error(500)) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
