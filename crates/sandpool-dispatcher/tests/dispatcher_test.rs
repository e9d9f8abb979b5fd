//! Dispatcher integration tests against the fake worker runtime.

mod support;

use axum::http::{header, Method, StatusCode};
use sandpool_common::InstanceId;
use sandpool_dispatcher::{Dispatcher, DispatcherConfig, InstancePool, InstanceState, PoolConfig};
use sandpool_metrics::DispatcherMetricsCollector;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use support::{address_of, body_string, fast_pool_config, pool_with, request, FakeRuntime};

fn dispatcher_with(
    runtime: Arc<FakeRuntime>,
    pool_config: PoolConfig,
    config: DispatcherConfig,
) -> (Dispatcher, InstancePool) {
    let pool = pool_with(runtime, pool_config);
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(DispatcherMetricsCollector::new()),
        config,
    );
    (dispatcher, pool)
}

async fn error_body(response: axum::http::Response<axum::body::Body>) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

#[tokio::test]
async fn test_forwards_and_releases_on_success() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(2), DispatcherConfig::default());

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, address_of(&InstanceId::new(1)));

    let instance = pool.get(&InstanceId::new(1)).unwrap();
    assert_eq!(instance.concurrent_requests, 0);
    assert_eq!(instance.consecutive_forward_failures, 0);

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(snapshot.instances["instance-1"].request_count, 1);
}

#[tokio::test]
async fn test_lease_held_while_body_streams() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime, fast_pool_config(1), DispatcherConfig::default());
    let id = InstanceId::new(1);

    let response = dispatcher.handle(request(Method::GET, "/download")).await;
    let before = pool.get(&id).unwrap();
    assert_eq!(before.concurrent_requests, 1);

    body_string(response).await;
    let after = pool.get(&id).unwrap();
    assert_eq!(after.concurrent_requests, 0);
    assert!(after.last_activity > before.last_activity);
}

#[tokio::test]
async fn test_idempotent_request_retried_on_other_instance() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(2), DispatcherConfig::default());
    pool.warm_up(2).await.unwrap();
    let (first, second) = (InstanceId::new(1), InstanceId::new(2));
    runtime.set_failing(&first, true);

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, address_of(&second));

    let forwarded: Vec<String> = runtime.forwarded().into_iter().map(|(a, _)| a).collect();
    assert_eq!(forwarded, vec![address_of(&first), address_of(&second)]);
    assert_eq!(pool.get(&first).unwrap().consecutive_forward_failures, 1);
    assert_eq!(pool.get(&first).unwrap().concurrent_requests, 0);
    assert_eq!(dispatcher.metrics().snapshot().retries, 1);
}

#[tokio::test]
async fn test_no_other_instance_returns_upstream_error() {
    let runtime = FakeRuntime::new();
    let (dispatcher, _pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(1), DispatcherConfig::default());
    runtime.set_failing(&InstanceId::new(1), true);

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_string(response).await;
    assert!(!body.contains("10.0.0."), "address leaked: {}", body);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "forward_failure");
    assert_eq!(json["instance_id"], 1);
    assert_eq!(runtime.forwarded().len(), 1);
}

#[tokio::test]
async fn test_sent_post_not_retried() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(2), DispatcherConfig::default());
    pool.warm_up(2).await.unwrap();
    runtime.set_failing(&InstanceId::new(1), true);

    let response = dispatcher.handle(request(Method::POST, "/convert")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(runtime.forwarded().len(), 1);
    assert_eq!(dispatcher.metrics().snapshot().retries, 0);
}

#[tokio::test]
async fn test_refused_post_retried() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(2), DispatcherConfig::default());
    pool.warm_up(2).await.unwrap();
    runtime.set_refusing(&InstanceId::new(1));

    let response = dispatcher.handle(request(Method::POST, "/convert")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, address_of(&InstanceId::new(2)));
    let methods: Vec<Method> = runtime.forwarded().into_iter().map(|(_, m)| m).collect();
    assert_eq!(methods, vec![Method::POST, Method::POST]);
}

#[tokio::test]
async fn test_retries_disabled() {
    let runtime = FakeRuntime::new();
    let config = DispatcherConfig {
        max_retries: 0,
        ..DispatcherConfig::default()
    };
    let (dispatcher, pool) = dispatcher_with(runtime.clone(), fast_pool_config(2), config);
    pool.warm_up(2).await.unwrap();
    runtime.set_failing(&InstanceId::new(1), true);

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(runtime.forwarded().len(), 1);
}

#[tokio::test]
async fn test_no_capacity_is_service_busy() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime, fast_pool_config(1), DispatcherConfig::default());
    pool.warm_up(1).await.unwrap();
    pool.mark_unhealthy(&InstanceId::new(1));

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    let json = error_body(response).await;
    assert_eq!(json["error"], "no_capacity");
    assert!(json["instance_id"].is_null());

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.rejected_requests, 1);
    assert_eq!(snapshot.successful_requests, 0);
}

#[tokio::test]
async fn test_waits_for_capacity() {
    let runtime = FakeRuntime::new();
    let config = DispatcherConfig {
        acquire_wait: Duration::from_secs(2),
        initial_backoff_ms: 20,
        ..DispatcherConfig::default()
    };
    let (dispatcher, pool) = dispatcher_with(runtime, fast_pool_config(1), config);
    pool.warm_up(1).await.unwrap();
    let id = InstanceId::new(1);
    pool.mark_unhealthy(&id);

    let recovering = {
        let pool = pool.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            pool.recover(&id);
        })
    };

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    recovering.await.unwrap();
}

#[tokio::test]
async fn test_forward_timeout() {
    let runtime = FakeRuntime::new();
    runtime.set_forward_delay(Duration::from_millis(500));
    let config = DispatcherConfig {
        forward_timeout: Duration::from_millis(50),
        ..DispatcherConfig::default()
    };
    let (dispatcher, pool) = dispatcher_with(runtime, fast_pool_config(1), config);

    let response = dispatcher.handle(request(Method::GET, "/slow")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = error_body(response).await;
    assert_eq!(body["error"], "forward_timeout");
    assert_eq!(body["instance_id"], 1);
    assert!(body["message"].as_str().unwrap().contains("instance-1"));
    assert_eq!(
        pool.get(&InstanceId::new(1)).unwrap().consecutive_forward_failures,
        1
    );
}

#[tokio::test]
async fn test_server_error_relayed_as_failure() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(1), DispatcherConfig::default());
    let id = InstanceId::new(1);
    runtime.set_status(&id, StatusCode::INTERNAL_SERVER_ERROR);

    let response = dispatcher.handle(request(Method::GET, "/convert")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    body_string(response).await;

    let instance = pool.get(&id).unwrap();
    assert_eq!(instance.consecutive_forward_failures, 1);
    assert_eq!(instance.concurrent_requests, 0);
    // The backend answered, so nothing was retried
    assert_eq!(runtime.forwarded().len(), 1);
    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(snapshot.instances["instance-1"].failure_count, 1);
}

#[tokio::test]
async fn test_repeated_failures_take_instance_out() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime.clone(), fast_pool_config(1), DispatcherConfig::default());
    let id = InstanceId::new(1);
    runtime.set_failing(&id, true);

    for _ in 0..3 {
        let response = dispatcher.handle(request(Method::GET, "/status")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
    assert_eq!(pool.get(&id).unwrap().state, InstanceState::Unhealthy);
    assert_eq!(pool.take_rechecks(), vec![id]);
}

#[tokio::test]
async fn test_cancelled_request_is_neutral() {
    let runtime = FakeRuntime::new();
    runtime.set_forward_delay(Duration::from_millis(500));
    let (dispatcher, pool) =
        dispatcher_with(runtime, fast_pool_config(1), DispatcherConfig::default());
    pool.warm_up(1).await.unwrap();

    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        dispatcher.handle(request(Method::GET, "/slow")),
    )
    .await;
    assert!(attempt.is_err());

    let instance = pool.get(&InstanceId::new(1)).unwrap();
    assert_eq!(instance.state, InstanceState::Ready);
    assert_eq!(instance.concurrent_requests, 0);
    assert_eq!(instance.consecutive_forward_failures, 0);
}

#[tokio::test]
async fn test_dropped_response_body_is_neutral() {
    let runtime = FakeRuntime::new();
    let (dispatcher, pool) =
        dispatcher_with(runtime, fast_pool_config(1), DispatcherConfig::default());

    let response = dispatcher.handle(request(Method::GET, "/download")).await;
    drop(response);

    let instance = pool.get(&InstanceId::new(1)).unwrap();
    assert_eq!(instance.concurrent_requests, 0);
    assert_eq!(instance.consecutive_forward_failures, 0);
}

#[tokio::test]
async fn test_startup_failure_is_upstream_unavailable() {
    let runtime = FakeRuntime::new();
    runtime.fail_starts(true);
    let (dispatcher, pool) =
        dispatcher_with(runtime, fast_pool_config(1), DispatcherConfig::default());

    let response = dispatcher.handle(request(Method::GET, "/status")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = error_body(response).await;
    assert_eq!(json["error"], "startup_failed");
    assert_eq!(json["instance_id"], 1);
    assert!(!json["message"].as_str().unwrap().contains("image"));
    assert_eq!(pool.active_count(), 0);
}
