//! Pool lifecycle integration tests.
//!
//! These drive a real `WorkerPool` through the `SandboxManager` against
//! the mock runner: warm-up, FIFO hand-off, recycling, reaping, and
//! shutdown.

use cordon::runner::MockRunner;
use cordon::{CallOutcome, CapabilityProfile, Error, PoolConfig, SandboxConfig, SandboxManager};
use std::sync::Arc;
use std::time::Duration;

fn manager(runner: &MockRunner, pool: PoolConfig) -> SandboxManager {
    SandboxManager::new(
        Arc::new(runner.clone()),
        SandboxConfig::new().with_pool(pool),
    )
    .expect("failed to build manager")
}

fn fast_pool() -> PoolConfig {
    PoolConfig::new().with_maintenance_interval(Duration::from_millis(20))
}

fn profile() -> CapabilityProfile {
    CapabilityProfile::new(200, 256)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn warm_up_reaches_min_size() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(2).with_max_size(4));
    let pool = manager.pool(&profile()).unwrap();

    wait_until("pool warm-up", || pool.status().ready == 2).await;

    let status = pool.status();
    assert_eq!(status.ready, 2);
    assert_eq!(status.in_use, 0);
    assert!(runner.boot_count() >= 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn occupancy_never_exceeds_max_size() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(2));
    let pool = manager.pool(&profile()).unwrap();

    let mut leases = Vec::new();
    for _ in 0..2 {
        leases.push(pool.acquire(Duration::from_secs(2)).await.unwrap());
    }

    // Saturated: a third acquisition must time out, and occupancy must
    // stay at the cap throughout.
    let status = pool.status();
    assert!(status.ready + status.in_use + status.booting <= 2);
    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted));
    // The expired waiter dequeued itself.
    assert_eq!(pool.status().waiting, 0);

    for lease in leases {
        lease.release(CallOutcome::Ok);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn no_vm_is_handed_to_two_acquirers() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(3).with_max_size(3));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 3).await;

    let (a, b, c) = tokio::join!(
        pool.acquire(Duration::from_secs(1)),
        pool.acquire(Duration::from_secs(1)),
        pool.acquire(Duration::from_secs(1)),
    );
    let leases = [a.unwrap(), b.unwrap(), c.unwrap()];

    let status = pool.status();
    assert_eq!(status.in_use, 3);
    assert_eq!(status.ready, 0);

    for lease in leases {
        lease.release(CallOutcome::Ok);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn waiters_are_served_in_fifo_order() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(1));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for tag in ["first", "second"] {
        let pool = Arc::clone(&pool);
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
            order.lock().unwrap().push(tag);
            lease.release(CallOutcome::Ok);
        }));
        // Ensure deterministic queue order.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    held.release(CallOutcome::Ok);
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn vm_is_retired_at_its_call_cap() {
    let runner = MockRunner::new();
    let manager = manager(
        &runner,
        fast_pool()
            .with_min_size(1)
            .with_max_size(2)
            .with_max_calls_per_vm(2),
    );
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release(CallOutcome::Ok);
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.call_count(), 1);
    lease.release(CallOutcome::Ok);

    // Second successful call hit the cap: the VM dies and the pool
    // replenishes with a fresh one.
    wait_until("retired VM killed", || runner.kill_count() == 1).await;
    wait_until("replacement booted", || {
        pool.status().ready == 1 && pool.status().ready_call_counts == vec![0]
    })
    .await;
    manager.shutdown().await;
}

#[tokio::test]
async fn dropped_lease_counts_as_a_fault() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(2));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(lease);

    wait_until("abandoned VM killed", || runner.kill_count() == 1).await;
    wait_until("pool replenished", || pool.status().ready == 1).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn idle_surplus_is_reaped_down_to_min_size() {
    let runner = MockRunner::new();
    let manager = manager(
        &runner,
        fast_pool()
            .with_min_size(1)
            .with_max_size(3)
            .with_max_idle(Duration::from_millis(50)),
    );
    let pool = manager.pool(&profile()).unwrap();

    // Force the pool up to three live VMs.
    let (a, b, c) = tokio::join!(
        pool.acquire(Duration::from_secs(2)),
        pool.acquire(Duration::from_secs(2)),
        pool.acquire(Duration::from_secs(2)),
    );
    a.unwrap().release(CallOutcome::Ok);
    b.unwrap().release(CallOutcome::Ok);
    c.unwrap().release(CallOutcome::Ok);
    assert_eq!(pool.status().ready, 3);

    wait_until("idle VMs reaped", || pool.status().ready == 1).await;
    assert!(runner.shutdown_count() >= 2 || runner.kill_count() >= 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn tainted_release_triggers_replacement() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(2));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release(CallOutcome::ProtocolError);

    wait_until("tainted VM killed", || runner.kill_count() == 1).await;
    wait_until("pool replenished", || pool.status().ready == 1).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_waiters_and_rejects_new_acquisitions() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(1));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(10)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.shutdown().await;

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Shutdown)));
    assert!(matches!(
        pool.acquire(Duration::from_secs(1)).await,
        Err(Error::Shutdown)
    ));

    // The in-flight lease is killed on release rather than recycled.
    held.release(CallOutcome::Ok);
    wait_until("held VM killed", || runner.kill_count() >= 1).await;
}

#[tokio::test]
async fn cancelled_waiter_leaves_no_vm_side_effects() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(1));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let token = cancel.clone();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.acquire_cancellable(Duration::from_secs(10), &token)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(runner.kill_count(), 0);
    assert_eq!(pool.status().waiting, 0);

    // The held VM still recycles normally afterwards.
    held.release(CallOutcome::Ok);
    wait_until("VM recycled", || pool.status().ready == 1).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn expired_waiters_do_not_accumulate_in_a_saturated_pool() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(1));
    let pool = manager.pool(&profile()).unwrap();
    wait_until("pool warm-up", || pool.status().ready == 1).await;

    // Keep the pool saturated so no dispatch ever drains the queue.
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    for _ in 0..5 {
        let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
    }
    assert_eq!(pool.status().waiting, 0);

    // The queue is genuinely empty: a release parks the VM as Ready
    // instead of offering it to stale waiters.
    held.release(CallOutcome::Ok);
    wait_until("VM recycled", || pool.status().ready == 1).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn one_pool_per_canonical_profile() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool());

    let a = CapabilityProfile::new(200, 256).dependency("b").dependency("A>=1");
    let b = CapabilityProfile::new(200, 256).dependency("a>=1").dependency("b");
    let c = CapabilityProfile::new(200, 512);

    let pool_a = manager.pool(&a).unwrap();
    let pool_b = manager.pool(&b).unwrap();
    let pool_c = manager.pool(&c).unwrap();

    assert!(Arc::ptr_eq(&pool_a, &pool_b));
    assert!(!Arc::ptr_eq(&pool_a, &pool_c));
    assert_eq!(manager.pool_count(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn boot_failures_do_not_wedge_the_pool() {
    let runner = MockRunner::new();
    let manager = manager(&runner, fast_pool().with_min_size(1).with_max_size(2));
    runner.fail_next_boot();
    let pool = manager.pool(&profile()).unwrap();

    // The first admission fails; maintenance keeps retrying until a
    // boot succeeds.
    wait_until("pool recovers from boot failure", || {
        pool.status().ready == 1
    })
    .await;
    manager.shutdown().await;
}
