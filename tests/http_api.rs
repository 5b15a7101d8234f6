use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use pgfleet::app::AppContext;
use pgfleet::collector::{self, run_cluster_info, run_metrics};
use pgfleet::config::{AppConfig, ClusterEndpoint, Timeouts};
use pgfleet::metrics::AppMetrics;
use pgfleet::{ConnectionRegistry, SharedState, http};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn test_context() -> AppContext {
    let config = AppConfig {
        timeouts: Timeouts {
            probe: Duration::from_millis(500),
            health_check: Duration::from_millis(500),
            query: Duration::from_millis(500),
            ..Timeouts::default()
        },
        ..AppConfig::default()
    };
    let registry = ConnectionRegistry::new(config.timeouts.clone(), true);
    let metrics = AppMetrics::new().expect("metrics registry");
    AppContext::new(config, registry, metrics, SharedState::new())
}

async fn get(ctx: &AppContext, uri: &str) -> (StatusCode, String) {
    let response = http::create_router(ctx.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn healthz_is_unavailable_without_clusters() {
    let ctx = test_context();
    let (status, _) = get(&ctx, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_cluster_routes_return_not_found() {
    let ctx = test_context();
    for uri in [
        "/api/v1/clusters/missing",
        "/api/v1/clusters/missing/metrics",
        "/api/v1/clusters/missing/health",
        "/api/v1/clusters/missing/alerts",
        "/api/v1/clusters/missing/pool",
        "/api/v1/clusters/missing/tables",
        "/api/v1/clusters/missing/queries",
    ] {
        let (status, body) = get(&ctx, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body.contains("missing"), "{uri}: {body}");
    }
}

#[tokio::test]
async fn cluster_listing_is_empty_json() {
    let ctx = test_context();
    let (status, body) = get(&ctx, "/api/v1/clusters").await;
    assert_eq!(status, StatusCode::OK);

    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["cluster_ids"], serde_json::json!([]));
    assert_eq!(value["clusters"], serde_json::json!([]));
}

#[tokio::test]
async fn metrics_endpoint_exposes_prometheus_text() {
    let ctx = test_context();
    ctx.metrics.observe_duration("metrics", Duration::from_millis(12));
    ctx.metrics.record_success("metrics", true);

    let (status, body) = get(&ctx, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("pgfleet_"), "{body}");
}

#[tokio::test]
async fn loop_health_is_served_as_json() {
    let ctx = test_context();
    ctx.state.record_loop_success("metrics").await;
    ctx.state
        .record_loop_failure("cluster_info", "no healthy cluster".to_string())
        .await;

    let (status, body) = get(&ctx, "/api/v1/loops").await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value[0]["name"], "cluster_info");
    assert_eq!(value[0]["consecutive_failures"], 1);
    assert_eq!(value[0]["last_error"], "no healthy cluster");
    assert_eq!(value[1]["name"], "metrics");
    assert!(value[1]["last_success_at"].is_i64());
}

#[tokio::test]
async fn unreachable_cluster_is_listed_as_unhealthy() {
    let ctx = test_context();
    let endpoint = ClusterEndpoint::new("down", "127.0.0.1", 1, "monitor", "postgres");
    ctx.cluster_info
        .register_cluster(collector::seed_info(&endpoint))
        .await;
    assert!(ctx.registry.add_cluster(endpoint.clone()).await.is_err());
    ctx.cluster_info.mark_unhealthy(&endpoint).await;

    let (status, body) = get(&ctx, "/api/v1/clusters/down").await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "unhealthy");

    // Known to the info collector, but it has no pool.
    let (status, _) = get(&ctx, "/api/v1/clusters/down/pool").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn loop_bodies_succeed_on_empty_registry() {
    let ctx = test_context();
    run_metrics(&ctx).await.expect("metrics tick");
    run_cluster_info(&ctx).await.expect("cluster info tick");
}

#[tokio::test]
async fn loops_become_ready_then_stop_on_cancel() {
    let ctx = test_context();
    let shutdown = CancellationToken::new();
    let handles = collector::spawn_all(ctx.clone(), shutdown.clone());

    // The first tick fires immediately; wait for both loops to record it.
    let mut ready = false;
    for _ in 0..50 {
        if ctx
            .state
            .is_ready(&collector::LOOP_NAMES, Duration::from_secs(60))
            .await
        {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready, "loops never completed a tick");

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop stops after cancel")
            .expect("loop task did not panic");
    }
}
