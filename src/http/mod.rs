use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::alert::{Alert, HealthStatus};
use crate::app::AppContext;
use crate::collector::LOOP_NAMES;
use crate::error::MonitorError;
use crate::model::{ClusterInfo, MetricsSnapshot, QueryMetrics, TableMetrics};
use crate::registry::PoolStats;
use crate::state::LoopHealth;

const MIN_READINESS_STALENESS: Duration = Duration::from_secs(180);

type ApiResult<T> = Result<Json<T>, MonitorError>;

pub fn create_router(ctx: AppContext) -> Router {
    let clusters = Router::new()
        .route("/", get(list_clusters))
        .route("/:id", get(get_cluster))
        .route("/:id/metrics", get(get_cluster_metrics))
        .route("/:id/health", get(get_cluster_health))
        .route("/:id/alerts", get(get_cluster_alerts))
        .route("/:id/pool", get(get_pool_stats))
        .route("/:id/tables", get(get_table_metrics))
        .route("/:id/queries", get(get_query_metrics))
        .route("/:id/queries/alerts", get(get_query_alerts));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/loops", get(get_loop_health))
        .nest("/api/v1/clusters", clusters)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn get_healthz(State(ctx): State<AppContext>) -> StatusCode {
    if ctx.registry.list_cluster_ids().await.is_empty() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let staleness = (ctx.config.sample_intervals.cluster_info() * 3).max(MIN_READINESS_STALENESS);
    if ctx.state.is_ready(&LOOP_NAMES, staleness).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn get_loop_health(State(ctx): State<AppContext>) -> Json<Vec<LoopHealth>> {
    Json(ctx.state.loop_health().await)
}

#[derive(Debug, Serialize)]
struct ClusterListing {
    cluster_ids: Vec<String>,
    clusters: Vec<ClusterInfo>,
}

async fn list_clusters(State(ctx): State<AppContext>) -> Json<ClusterListing> {
    let mut cluster_ids = ctx.registry.list_cluster_ids().await;
    cluster_ids.sort();
    let clusters = ctx.cluster_info.list_clusters().await;
    Json(ClusterListing {
        cluster_ids,
        clusters,
    })
}

async fn get_cluster(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<ClusterInfo> {
    Ok(Json(ctx.cluster_info.get_cluster(&id).await?))
}

async fn get_cluster_metrics(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<MetricsSnapshot> {
    Ok(Json(ctx.collector.get_metrics_snapshot(&id).await?))
}

/// Snapshot from the last metrics tick, or a live one before the first tick.
async fn current_snapshot(ctx: &AppContext, id: &str) -> Result<MetricsSnapshot, MonitorError> {
    // Unknown ids are NotFound even when a stale snapshot lingers.
    ctx.registry.endpoint(id).await?;
    match ctx.state.latest_snapshot(id).await {
        Some(snapshot) => Ok(snapshot),
        None => ctx.collector.get_metrics_snapshot(id).await,
    }
}

async fn get_cluster_health(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<HealthStatus> {
    let snapshot = current_snapshot(&ctx, &id).await?;
    let alerts = ctx.analyzer.analyze_metrics(&snapshot);
    Ok(Json(ctx.analyzer.generate_health_status(&id, &snapshot, &alerts)))
}

async fn get_cluster_alerts(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Alert>> {
    let snapshot = current_snapshot(&ctx, &id).await?;
    Ok(Json(ctx.analyzer.analyze_metrics(&snapshot)))
}

async fn get_pool_stats(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult<PoolStats> {
    Ok(Json(ctx.registry.stats(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseFilter {
    database: Option<String>,
}

async fn get_table_metrics(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(filter): Query<DatabaseFilter>,
) -> ApiResult<Vec<TableMetrics>> {
    let tables = ctx
        .collector
        .collect_table_metrics(&id, filter.database.as_deref())
        .await?;
    Ok(Json(tables))
}

async fn get_query_metrics(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(filter): Query<DatabaseFilter>,
) -> ApiResult<Vec<QueryMetrics>> {
    let queries = ctx
        .collector
        .collect_query_metrics(&id, filter.database.as_deref())
        .await?;
    Ok(Json(queries))
}

async fn get_query_alerts(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(filter): Query<DatabaseFilter>,
) -> ApiResult<Vec<Alert>> {
    let queries = ctx
        .collector
        .collect_query_metrics(&id, filter.database.as_deref())
        .await?;
    let alerts = queries
        .iter()
        .flat_map(|query| ctx.analyzer.analyze_query_performance(query))
        .collect();
    Ok(Json(alerts))
}
