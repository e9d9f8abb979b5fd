//! Health checker integration tests.

mod support;

use sandpool_common::{InstanceId, ProbeStatus, SandpoolError};
use sandpool_dispatcher::{
    HealthCheckConfig, HealthChecker, InstancePool, InstanceState, Outcome, PoolConfig,
};
use std::time::Duration;
use support::{eventually, fast_pool_config, pool_with, FakeRuntime};

fn health_config() -> HealthCheckConfig {
    HealthCheckConfig {
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(100),
        failure_threshold: 3,
    }
}

async fn single_instance_pool() -> (std::sync::Arc<FakeRuntime>, InstancePool, InstanceId) {
    let runtime = FakeRuntime::new();
    let pool = pool_with(runtime.clone(), fast_pool_config(1));
    assert_eq!(pool.warm_up(1).await.unwrap(), 1);
    (runtime, pool, InstanceId::new(1))
}

#[tokio::test]
async fn test_three_failed_probes_exclude_until_recovery() {
    let (runtime, pool, id) = single_instance_pool().await;
    let checker = HealthChecker::new(pool.clone(), health_config());
    // Keep a request in flight throughout: recovery does not wait for it
    let lease = pool.acquire().await.unwrap();

    runtime.set_unhealthy(&id, true);
    checker.check_all().await;
    checker.check_all().await;
    let instance = pool.get(&id).unwrap();
    assert_eq!(instance.state, InstanceState::Ready);
    assert_eq!(instance.consecutive_probe_failures, 2);

    checker.check_all().await;
    assert_eq!(pool.get(&id).unwrap().state, InstanceState::Unhealthy);
    assert!(matches!(
        pool.acquire().await,
        Err(SandpoolError::NoCapacity { .. })
    ));

    runtime.set_unhealthy(&id, false);
    checker.check_all().await;
    let instance = pool.get(&id).unwrap();
    assert_eq!(instance.state, InstanceState::Ready);
    assert_eq!(instance.consecutive_probe_failures, 0);
    assert_eq!(instance.concurrent_requests, 1);
    assert_eq!(pool.acquire().await.unwrap().id(), &id);

    lease.release(Outcome::Success);
}

#[tokio::test]
async fn test_healthy_probe_resets_failure_count() {
    let (runtime, pool, id) = single_instance_pool().await;
    let checker = HealthChecker::new(pool.clone(), health_config());

    for unhealthy in [true, true, false, true, true] {
        runtime.set_unhealthy(&id, unhealthy);
        checker.check_all().await;
    }
    let instance = pool.get(&id).unwrap();
    assert_eq!(instance.state, InstanceState::Ready);
    assert_eq!(instance.consecutive_probe_failures, 2);
    assert!(instance.last_probe.is_some());
}

#[tokio::test]
async fn test_probe_timeout_counts_as_failure() {
    let (runtime, pool, id) = single_instance_pool().await;
    let checker = HealthChecker::new(pool.clone(), health_config());
    runtime.set_probe_delay(Duration::from_millis(300));

    for _ in 0..3 {
        checker.check_all().await;
    }
    let instance = pool.get(&id).unwrap();
    assert_eq!(instance.state, InstanceState::Unhealthy);
    assert_eq!(instance.last_probe_status, Some(ProbeStatus::Timeout));
}

#[tokio::test]
async fn test_unhealthy_past_grace_is_replaced() {
    let runtime = FakeRuntime::new();
    let config = PoolConfig {
        unhealthy_grace: Duration::ZERO,
        ..fast_pool_config(1)
    };
    let pool = pool_with(runtime.clone(), config);
    assert_eq!(pool.warm_up(1).await.unwrap(), 1);
    let id = InstanceId::new(1);
    let checker = HealthChecker::new(pool.clone(), health_config());
    runtime.set_unhealthy(&id, true);

    for _ in 0..3 {
        checker.check_all().await;
    }
    eventually(Duration::from_secs(2), || pool.get(&id).is_none()).await;
    assert_eq!(runtime.stopped(), vec![id]);

    // The freed slot goes to a fresh instance
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), &InstanceId::new(2));
}

#[tokio::test]
async fn test_unhealthy_within_grace_is_kept() {
    let (runtime, pool, id) = single_instance_pool().await;
    let checker = HealthChecker::new(pool.clone(), health_config());
    runtime.set_unhealthy(&id, true);

    for _ in 0..5 {
        checker.check_all().await;
    }
    assert_eq!(pool.get(&id).unwrap().state, InstanceState::Unhealthy);
    assert!(runtime.stopped().is_empty());
}

#[tokio::test]
async fn test_recheck_after_forward_failures() {
    let (_runtime, pool, id) = single_instance_pool().await;
    let checker = HealthChecker::new(pool.clone(), health_config());

    for _ in 0..3 {
        pool.acquire().await.unwrap().release(Outcome::Failure);
    }
    assert_eq!(pool.get(&id).unwrap().state, InstanceState::Unhealthy);

    // The probe passes, so the failures were transient
    checker.recheck_pending().await;
    let instance = pool.get(&id).unwrap();
    assert_eq!(instance.state, InstanceState::Ready);
    assert_eq!(instance.consecutive_forward_failures, 0);
    assert!(pool.take_rechecks().is_empty());
}

#[tokio::test]
async fn test_background_checker_marks_unhealthy() {
    let (runtime, pool, id) = single_instance_pool().await;
    runtime.set_unhealthy(&id, true);

    let handle = HealthChecker::new(pool.clone(), health_config()).spawn();
    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.abort();

    assert_eq!(pool.get(&id).unwrap().state, InstanceState::Unhealthy);
}

#[tokio::test]
async fn test_background_checker_answers_recheck() {
    let (_runtime, pool, id) = single_instance_pool().await;
    let config = HealthCheckConfig {
        interval: Duration::from_secs(3600),
        ..health_config()
    };
    let handle = HealthChecker::new(pool.clone(), config).spawn();
    // Let the immediate first tick pass
    tokio::time::sleep(Duration::from_millis(20)).await;

    for _ in 0..3 {
        pool.acquire().await.unwrap().release(Outcome::Failure);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    assert_eq!(pool.get(&id).unwrap().state, InstanceState::Ready);
}

#[tokio::test]
async fn test_checker_keeps_running_while_instance_drains() {
    let runtime = FakeRuntime::new();
    let config = PoolConfig {
        unhealthy_grace: Duration::from_millis(100),
        force_kill_timeout: Duration::from_secs(5),
        ..fast_pool_config(2)
    };
    let pool = pool_with(runtime.clone(), config);
    assert_eq!(pool.warm_up(2).await.unwrap(), 2);
    let (first, second) = (InstanceId::new(1), InstanceId::new(2));

    // The first instance goes unhealthy with a request still open
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), &first);
    runtime.set_unhealthy(&first, true);
    assert!(pool.mark_unhealthy(&first));
    let checker = HealthChecker::new(pool.clone(), health_config());
    let started = std::time::Instant::now();
    checker.check_all().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    runtime.set_unhealthy(&second, true);
    let handle = checker.spawn();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.get(&first).unwrap().state, InstanceState::Draining);

    // The second instance is still checked while the first one drains
    eventually(Duration::from_secs(2), || pool.get(&second).is_none()).await;
    assert_eq!(runtime.stopped(), vec![second]);
    assert_eq!(pool.get(&first).unwrap().state, InstanceState::Draining);
    handle.abort();

    lease.release(Outcome::Success);
    eventually(Duration::from_secs(2), || pool.get(&first).is_none()).await;
}
