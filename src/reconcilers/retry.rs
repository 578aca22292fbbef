// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Retry helpers for optimistic-concurrency API updates.
//!
//! Transient API errors (429, 5xx, network) are handled by the work queues'
//! rate-limited requeue, so individual API calls are not wrapped here.
//! Conflicts (409) get their own short, fixed-interval budget: the
//! read-modify-write loops around finalizer edits re-read the entity each
//! attempt and retry until the budget is spent.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Attempts allowed in a retry-on-conflict loop
const CONFLICT_RETRY_STEPS: u32 = 5;

/// Sleep between conflict retries (10ms, jittered)
const CONFLICT_RETRY_INTERVAL_MILLIS: u64 = 10;

/// Retry an optimistic-concurrency mutation while it returns conflicts.
///
/// The operation must re-read the entity on each attempt so the retry
/// observes the state that won the race. Budget: 5 attempts with short,
/// jittered sleeps.
///
/// # Errors
///
/// Returns the final error when a non-conflict error is hit or the attempt
/// budget is spent.
pub async fn retry_on_conflict<T, F, Fut>(mut operation: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) && attempt < CONFLICT_RETRY_STEPS => {
                debug!(attempt, "Conflict on optimistic update, retrying");
                let base = Duration::from_millis(CONFLICT_RETRY_INTERVAL_MILLIS);
                let jitter = rand::thread_rng().gen_range(0.9..1.1);
                tokio::time::sleep(base.mul_f64(jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether an error is an optimistic-concurrency conflict (409).
#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409)
}

/// Whether an error is a not-found (404) response.
///
/// Reconcilers coalesce not-found on their primary entity into a successful
/// no-op.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

/// Whether an error chain bottoms out in a Kubernetes 404.
#[must_use]
pub fn chain_is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<kube::Error>().is_some_and(is_not_found)
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
