mod support;

use std::sync::Arc;
use std::time::Duration;

use pve_pool_common::PoolConfig;
use pve_pool_core::pool::ContainerState;
use pve_pool_core::{CloneQueue, CloneWorker, PoolManager};
use support::MockPveClient;
use tokio_util::sync::CancellationToken;

fn test_config(target_size: usize, batch: usize) -> PoolConfig {
    PoolConfig {
        pve_api_url: "https://pve.test:8006".to_string(),
        pve_api_token: "user@pve!tok=secret".to_string(),
        pve_node: Some("node1".to_string()),
        pve_verify_tls: false,
        pool_min_size: 3,
        pool_max_size: 10,
        target_size,
        replenish_interval: Duration::from_secs(30),
        replenish_batch_size: batch,
        hostname_prefix: "pool-".to_string(),
        container_vmid_start: 200,
        clone_max_retries: 3,
        clone_retry_delay: Duration::from_millis(50),
        clone_retry_jitter: Duration::from_millis(0),
    }
}

fn harness(config: PoolConfig) -> (PoolManager, Arc<MockPveClient>, CloneWorker, CancellationToken) {
    let pve = Arc::new(MockPveClient::new());
    let (queue, rx) = CloneQueue::new();
    let manager = PoolManager::new(pve.clone(), config, queue.clone());
    let worker = CloneWorker::new(manager.clone(), queue, rx);
    (manager, pve, worker, CancellationToken::new())
}

// With an empty target pool, on-demand allocation goes through the slow path.
#[tokio::test]
async fn allocate_with_empty_pool_clones_on_demand() {
    let (manager, _pve, worker, cancel) = harness(test_config(0, 1));
    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    let (container, from_pool) = manager.allocate(9001, "pvelxc-aaaa").await.unwrap();
    assert!(!from_pool);
    assert_eq!(container.template_vmid, 9001);
    assert!(matches!(container.state, ContainerState::Allocated));

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Cold start, warm, allocate: after replenish, ready_count+creating == target;
// once ready, allocation pops from the pool and triggers a background top-up.
#[tokio::test]
async fn replenish_then_allocate_serves_from_pool() {
    let (manager, _pve, worker, cancel) = harness(test_config(2, 2));
    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    manager.ensure_pool_for_template(9001).await;

    // Let the worker drain the queue.
    for _ in 0..50 {
        let status = manager.get_status().await;
        let t = &status.templates[&9001];
        if t.ready_count + t.creating_count >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = manager.get_status().await;
    let t = &status.templates[&9001];
    assert_eq!(t.ready_count + t.creating_count, 2);

    let (container, from_pool) = manager.allocate(9001, "pvelxc-aaaa").await.unwrap();
    assert!(from_pool);

    // Allow the spawned top-up replenish to enqueue.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = manager.get_status().await;
    let t = &status.templates[&9001];
    assert_eq!(t.ready_count, 1);
    assert!(matches!(container.state, ContainerState::Allocated));

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Two "locked" failures followed by success still yields READY, not FAILED.
#[tokio::test]
async fn clone_retries_past_lock_errors_then_succeeds() {
    let (manager, pve, worker, cancel) = harness(test_config(0, 1));
    pve.push_clone_outcome(Err("CT 9001 is locked (clone)")).await;
    pve.push_clone_outcome(Err("CT 9001 is locked (clone)")).await;
    pve.push_clone_outcome(Ok(())).await;

    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    let start = std::time::Instant::now();
    let (container, _) = manager.allocate(9001, "pvelxc-bbbb").await.unwrap();
    let elapsed = start.elapsed();

    assert!(matches!(container.state, ContainerState::Allocated));
    assert!(elapsed >= Duration::from_millis(100), "elapsed={elapsed:?}");

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Exhausting all retries marks the container FAILED and attempts one delete.
#[tokio::test]
async fn clone_exhausting_retries_marks_failed_and_deletes() {
    let (manager, pve, worker, cancel) = harness(test_config(0, 1));
    for _ in 0..3 {
        pve.push_clone_outcome(Err("CT 9001 is locked (clone)")).await;
    }

    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    let err = manager.allocate(9001, "pvelxc-cccc").await.unwrap_err();
    assert!(err.to_string().contains("clone failed"));
    assert_eq!(pve.delete_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    cancel.cancel();
    worker_handle.await.unwrap();
}

// A non-lock error is never retried.
#[tokio::test]
async fn clone_with_non_lock_error_does_not_retry() {
    let (manager, pve, worker, cancel) = harness(test_config(0, 1));
    pve.push_clone_outcome(Err("no space left on device")).await;

    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    manager.allocate(9001, "pvelxc-dddd").await.unwrap_err();
    assert_eq!(pve.clone_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Release round-trips a container back to READY and clears allocation fields.
#[tokio::test]
async fn release_returns_container_to_ready() {
    let (manager, pve, worker, cancel) = harness(test_config(0, 1));
    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    let (container, _) = manager.allocate(9001, "pvelxc-eeee").await.unwrap();
    manager.release(container.vmid).await.unwrap();

    let status = manager.get_status().await;
    let summary = status.templates[&9001]
        .containers
        .iter()
        .find(|c| c.vmid == container.vmid)
        .unwrap();
    assert_eq!(summary.state, "READY");
    assert!(summary.allocated_to.is_none());
    assert_eq!(pve.stop_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Removing an already-removed container is a no-op, not an error.
#[tokio::test]
async fn remove_is_idempotent() {
    let (manager, _pve, worker, cancel) = harness(test_config(0, 1));
    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    let (container, _) = manager.allocate(9001, "pvelxc-ffff").await.unwrap();
    manager.remove(container.vmid).await;
    manager.remove(container.vmid).await; // second call: no panic, no-op

    let status = manager.get_status().await;
    assert!(status
        .templates
        .get(&9001)
        .map(|t| t.containers.iter().all(|c| c.vmid != container.vmid))
        .unwrap_or(true));

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Startup discovery reconstructs READY/ALLOCATED state from hostnames.
#[tokio::test]
async fn discovery_reconstructs_pool_from_hostnames() {
    let (manager, pve, _worker, _cancel) = harness(test_config(0, 1));
    pve.seed_container(201, "pool-9001-ab12cd34", "stopped").await;
    pve.seed_container(202, "pool-9001-99887766", "running").await;
    pve.seed_container(203, "unrelated-host", "running").await;

    manager.discover().await;

    let status = manager.get_status().await;
    let t = &status.templates[&9001];
    assert_eq!(t.ready_count, 1);
    assert_eq!(t.allocated_count, 1);
    assert_eq!(t.containers.len(), 2);
    let allocated = t
        .containers
        .iter()
        .find(|c| c.vmid == 202)
        .unwrap();
    assert!(allocated.allocated_to.is_some());
}

// next_vmid never reissues a vmid already reserved.
#[tokio::test]
async fn next_vmid_is_unique_across_many_calls() {
    let (manager, _pve, _worker, _cancel) = harness(test_config(0, 1));
    let mut seen = std::collections::HashSet::new();
    for _ in 0..50 {
        let vmid = manager.next_vmid().await.unwrap();
        assert!(seen.insert(vmid), "duplicate vmid {vmid}");
    }
}

// Concurrency stress: N concurrent allocations against a pre-warmed pool
// of size K yield exactly K from_pool=true, the rest false, no vmid
// collisions, and PVE never sees more than one in-flight clone.
#[tokio::test]
async fn concurrent_allocations_respect_pool_size_and_serialize_clones() {
    let (manager, pve, worker, cancel) = harness(test_config(5, 5));
    let cancel_for_worker = cancel.clone();
    let worker_handle = tokio::spawn(worker.run(cancel_for_worker));

    manager.ensure_pool_for_template(9001).await;
    for _ in 0..100 {
        let status = manager.get_status().await;
        if status.templates[&9001].ready_count == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.get_status().await.templates[&9001].ready_count, 5);

    let mut handles = Vec::new();
    for i in 0..20 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .allocate(9001, &format!("pvelxc-{i:04}"))
                .await
                .unwrap()
        }));
    }

    let mut from_pool_count = 0;
    let mut vmids = std::collections::HashSet::new();
    for h in handles {
        let (container, from_pool) = h.await.unwrap();
        if from_pool {
            from_pool_count += 1;
        }
        assert!(vmids.insert(container.vmid), "duplicate vmid allocated");
    }

    assert_eq!(from_pool_count, 5);
    assert_eq!(
        pve.max_observed_concurrency.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "PVE observed more than one concurrent clone"
    );

    cancel.cancel();
    worker_handle.await.unwrap();
}

// Unknown vmids on release/remove are logged and treated as a no-op, never
// an error surfaced to the caller.
#[tokio::test]
async fn release_and_remove_on_unknown_vmid_are_noops() {
    let (manager, _pve, _worker, _cancel) = harness(test_config(0, 1));
    manager.release(999_999).await.unwrap();
    manager.remove(999_999).await;
}
