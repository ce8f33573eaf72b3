use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pulsewatch_domain::{AcquirePriority, HealthLevel, PoolConfig, PoolError};
use pulsewatch_ports::{ConnectionFactory, HealthReporter};

use crate::ConnectionPoolManager;

#[derive(Default)]
struct Counters {
    opened: AtomicU32,
    failures_left: AtomicU32,
    resets: AtomicU32,
}

#[derive(Clone, Default)]
struct TestFactory(Arc<Counters>);

#[async_trait]
impl ConnectionFactory for TestFactory {
    type Connection = u32;

    async fn connect(&self) -> Result<u32> {
        let failing = self
            .0
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection refused");
        }
        Ok(self.0.opened.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn reset(&self, _connection: &mut u32) -> Result<()> {
        self.0.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(min: usize, max: usize, initial: usize) -> PoolConfig {
    PoolConfig {
        min_size: min,
        max_size: max,
        initial_size: initial,
        ..PoolConfig::default()
    }
}

const SECOND: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn saturated_pool_grows_by_step_up_to_max() {
    let pool = ConnectionPoolManager::new(
        TestFactory::default(),
        PoolConfig {
            resize_step: 3,
            ..config(2, 10, 4)
        },
    );

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap());
    }
    assert_eq!(pool.recompute_capacity(), 7);

    for _ in 0..3 {
        held.push(pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap());
    }
    assert_eq!(pool.recompute_capacity(), 10);

    for _ in 0..3 {
        held.push(pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap());
    }
    assert_eq!(pool.recompute_capacity(), 10);
    assert_eq!(pool.stats().peak_in_use, 10);

    for handle in held.drain(..) {
        pool.release(handle).await;
    }
    assert_eq!(pool.recompute_capacity(), 7);
    assert_eq!(pool.recompute_capacity(), 4);
    assert_eq!(pool.recompute_capacity(), 2);
    assert_eq!(pool.recompute_capacity(), 2);
}

#[tokio::test(start_paused = true)]
async fn capacity_only_moves_on_tick() {
    let pool = ConnectionPoolManager::new(TestFactory::default(), config(1, 10, 2));
    let _a = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    let _b = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    assert_eq!(pool.capacity(), 2);
    assert_eq!(pool.stats().utilization, 1.0);
}

#[tokio::test(start_paused = true)]
async fn waiter_times_out_then_gets_released_connection() {
    let pool = Arc::new(ConnectionPoolManager::new(
        TestFactory::default(),
        config(1, 2, 2),
    ));
    let first = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    let _second = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();

    let err = pool
        .acquire(AcquirePriority::Normal, SECOND)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::Timeout { last_error: None, .. }));
    assert_eq!(pool.stats().timeouts, 1);
    let health = pool.component_health();
    assert_eq!(health.level, HealthLevel::Warning);
    assert_eq!(pool.component_health(), health);

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.acquire(AcquirePriority::Normal, Duration::from_secs(5))
                .await
                .map(|handle| *handle)
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let first_id = *first;
    pool.release(first).await;

    assert_eq!(waiter.await.unwrap().unwrap(), first_id);
    assert_eq!(pool.stats().created, 2);
}

#[tokio::test(start_paused = true)]
async fn no_wait_policy_reports_exhaustion() {
    let pool = ConnectionPoolManager::new(
        TestFactory::default(),
        PoolConfig {
            wait_for_capacity: false,
            ..config(1, 2, 2)
        },
    );
    let _a = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    let _b = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();

    let err = pool
        .acquire(AcquirePriority::Critical, SECOND)
        .await
        .err()
        .unwrap();
    assert_eq!(err, PoolError::Exhausted { max: 2 });
    assert_eq!(pool.stats().exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn connect_failures_retry_within_budget() {
    let factory = TestFactory::default();
    factory.0.failures_left.store(2, Ordering::SeqCst);
    let pool = ConnectionPoolManager::new(
        factory.clone(),
        PoolConfig {
            retry_interval: Duration::from_millis(100),
            ..config(1, 4, 2)
        },
    );

    let handle = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    assert_eq!(*handle, 1);
    assert_eq!(pool.stats().in_use, 1);

    factory.0.failures_left.store(1_000, Ordering::SeqCst);
    let err = pool
        .acquire(AcquirePriority::Normal, SECOND)
        .await
        .err()
        .unwrap();
    match err {
        PoolError::Timeout { last_error, .. } => {
            assert!(last_error.unwrap().contains("connection refused"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(pool.stats().in_use, 1);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_without_retry_surfaces_immediately() {
    let factory = TestFactory::default();
    factory.0.failures_left.store(1, Ordering::SeqCst);
    let pool = ConnectionPoolManager::new(
        factory,
        PoolConfig {
            retry_on_failure: false,
            ..config(1, 4, 2)
        },
    );

    let err = pool
        .acquire(AcquirePriority::Normal, SECOND)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::Connect(reason) if reason.contains("refused")));
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn reserved_slots_only_serve_high_priority() {
    let pool = ConnectionPoolManager::new(
        TestFactory::default(),
        PoolConfig {
            wait_for_capacity: false,
            reserved_for_high_priority: 1,
            ..config(1, 2, 2)
        },
    );
    let _normal = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();

    let err = pool
        .acquire(AcquirePriority::Low, SECOND)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::Exhausted { .. }));

    let high = pool.acquire(AcquirePriority::High, SECOND).await;
    assert!(high.is_ok());
}

#[tokio::test(start_paused = true)]
async fn release_resets_and_reuses_while_drop_discards() {
    let factory = TestFactory::default();
    let pool = ConnectionPoolManager::new(factory.clone(), config(1, 1, 1));

    let handle = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    pool.release(handle).await;
    assert_eq!(factory.0.resets.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().idle, 1);

    let reused = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    assert_eq!(*reused, 1);
    drop(reused);

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.destroyed, 1);

    let fresh = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    assert_eq!(*fresh, 2);
}

#[tokio::test(start_paused = true)]
async fn maintenance_keeps_minimum_warm_and_close_rejects() {
    let pool = ConnectionPoolManager::new(TestFactory::default(), config(2, 4, 2));
    assert_eq!(pool.warm_up().await.unwrap(), 2);
    assert_eq!(pool.stats().idle, 2);

    tokio::time::advance(Duration::from_secs(11 * 60)).await;
    let report = pool.maintain().await.unwrap();
    assert_eq!(report.evicted, 0);

    tokio::time::advance(Duration::from_secs(20 * 60)).await;
    let report = pool.maintain().await.unwrap();
    assert_eq!(report.evicted, 2);
    assert_eq!(report.opened, 2);
    assert_eq!(pool.stats().created, 4);

    pool.close();
    let err = pool
        .acquire(AcquirePriority::Critical, SECOND)
        .await
        .err()
        .unwrap();
    assert_eq!(err, PoolError::Closed);
    assert_eq!(pool.component_health().level, HealthLevel::Critical);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_warning_lasts_for_the_health_window() {
    let pool = ConnectionPoolManager::new(
        TestFactory::default(),
        PoolConfig {
            health_window: Duration::from_secs(60),
            ..config(1, 4, 1)
        },
    );
    let held = pool.acquire(AcquirePriority::Normal, SECOND).await.unwrap();
    assert!(pool.acquire(AcquirePriority::Normal, SECOND).await.is_err());
    pool.release(held).await;

    for _ in 0..3 {
        assert_eq!(pool.component_health().level, HealthLevel::Warning);
    }
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pool.component_health().level, HealthLevel::Warning);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(pool.component_health().level, HealthLevel::Healthy);
    assert_eq!(pool.stats().timeouts, 1);
}
