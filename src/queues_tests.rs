// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

//! Unit tests for the retrying work queue.

use super::*;
use crate::crd::{NodeAssignmentGroup, NodeAssignmentGroupSpec};
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::watcher::Event;
use std::sync::atomic::{AtomicU32, Ordering};

fn nag(name: &str) -> NodeAssignmentGroup {
    NodeAssignmentGroup::new(name, NodeAssignmentGroupSpec::default())
}

fn seeded_store(nags: &[NodeAssignmentGroup]) -> (Store<NodeAssignmentGroup>, Writer<NodeAssignmentGroup>) {
    let (store, mut writer) = reflector::store();
    for nag in nags {
        writer.apply_watcher_event(&Event::Apply(nag.clone()));
    }
    (store, writer)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_processes_added_entity() {
    let entity = nag("g1");
    let (store, _writer) = seeded_store(std::slice::from_ref(&entity));
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 1));

    let processed = Arc::new(AtomicU32::new(0));
    let counter = processed.clone();
    queue.run(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    queue.add(&entity);
    wait_for(|| processed.load(Ordering::SeqCst) == 1).await;

    queue.shutdown();
}

#[tokio::test]
async fn test_duplicate_pending_keys_coalesce() {
    let entity = nag("g1");
    let (store, _writer) = seeded_store(std::slice::from_ref(&entity));
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 1));

    // Enqueue before any worker runs so both adds land in the pending set
    queue.add(&entity);
    queue.add(&entity);
    queue.add(&entity);

    let processed = Arc::new(AtomicU32::new(0));
    let counter = processed.clone();
    queue.run(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    wait_for(|| processed.load(Ordering::SeqCst) >= 1).await;
    // Give a stray duplicate a chance to surface
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 1);

    queue.shutdown();
}

#[tokio::test]
async fn test_add_during_processing_requeues_once() {
    let entity = nag("g1");
    let (store, _writer) = seeded_store(std::slice::from_ref(&entity));
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 1));

    let processed = Arc::new(AtomicU32::new(0));
    let counter = processed.clone();
    let requeue_target = entity.clone();
    let queue_for_processor = queue.clone();
    queue.run(move |_| {
        let counter = counter.clone();
        let queue = queue_for_processor.clone();
        let entity = requeue_target.clone();
        async move {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            if run == 0 {
                // Adds that arrive while the key is in flight must cause
                // exactly one re-queue
                queue.add(&entity);
                queue.add(&entity);
            }
            Ok(())
        }
    });

    queue.add(&entity);
    wait_for(|| processed.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 2);

    queue.shutdown();
}

#[tokio::test]
async fn test_errors_retry_with_budget() {
    let entity = nag("g1");
    let (store, _writer) = seeded_store(std::slice::from_ref(&entity));
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 1));

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    queue.run(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("transient failure")
        }
    });

    queue.add(&entity);
    // 1 initial attempt + 5 retries, then the key is dropped
    wait_for(|| attempts.load(Ordering::SeqCst) == 6).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 6);

    queue.shutdown();
}

#[tokio::test]
async fn test_success_resets_retry_history() {
    let entity = nag("g1");
    let (store, _writer) = seeded_store(std::slice::from_ref(&entity));
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 1));

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    queue.run(move |_| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                anyhow::bail!("first attempt fails")
            }
            Ok(())
        }
    });

    queue.add(&entity);
    wait_for(|| attempts.load(Ordering::SeqCst) == 2).await;

    // A later failure starts a fresh budget rather than continuing the old
    // count; observable as the key being retried again instead of dropped
    queue.add(&entity);
    wait_for(|| attempts.load(Ordering::SeqCst) >= 3).await;

    queue.shutdown();
}

#[tokio::test]
async fn test_missing_entity_is_forgotten_without_processing() {
    let (store, _writer) = seeded_store(&[]);
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 1));

    let processed = Arc::new(AtomicU32::new(0));
    let counter = processed.clone();
    queue.run(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    // The entity is not in the store; the processor must never run
    queue.add(&nag("ghost"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 0);

    queue.shutdown();
}

#[tokio::test]
async fn test_shutdown_stops_workers() {
    let entity = nag("g1");
    let (store, _writer) = seeded_store(std::slice::from_ref(&entity));
    let queue = Arc::new(RetryingWorkQueue::new("Test", store, 2));

    let handles = queue.run(|_| async { Ok(()) });
    queue.shutdown();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .expect("worker panicked");
    }
}
