use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::alert::AlertSeverity;
use crate::app::AppContext;
use crate::error::MonitorError;
use crate::model::ClusterStatus;

mod cluster_info;
mod snapshot;
mod source;
mod util;

pub use cluster_info::{ClusterInfoCollector, ConfigurationUpdate, collect_configuration, seed_info};
pub use snapshot::{MetricsCollector, collect_snapshot};
pub use source::{ConnectionCounts, DiskBlocks, PgStatsSource, StatsSource};

pub const METRICS_LOOP: &str = "metrics";
pub const CLUSTER_INFO_LOOP: &str = "cluster_info";
pub const LOOP_NAMES: [&str; 2] = [METRICS_LOOP, CLUSTER_INFO_LOOP];

/// The two scheduled collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectorLoop {
    Metrics,
    ClusterInfo,
}

impl CollectorLoop {
    fn name(self) -> &'static str {
        match self {
            Self::Metrics => METRICS_LOOP,
            Self::ClusterInfo => CLUSTER_INFO_LOOP,
        }
    }

    async fn run(self, ctx: &AppContext) -> Result<()> {
        match self {
            Self::Metrics => run_metrics(ctx).await,
            Self::ClusterInfo => run_cluster_info(ctx).await,
        }
    }
}

/// Spawn both collector loops; they stop between ticks once `shutdown` fires.
pub fn spawn_all(ctx: AppContext, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let intervals = ctx.config.sample_intervals.clone();

    vec![
        spawn_loop(
            ctx.clone(),
            shutdown.clone(),
            CollectorLoop::Metrics,
            intervals.metrics,
        ),
        spawn_loop(
            ctx,
            shutdown,
            CollectorLoop::ClusterInfo,
            intervals.cluster_info(),
        ),
    ]
}

fn spawn_loop(
    ctx: AppContext,
    shutdown: CancellationToken,
    kind: CollectorLoop,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let loop_name = kind.name();
        info!(loop_name, interval = ?interval, "starting collector loop");

        // The first tick completes immediately so every loop runs at startup.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(loop_name, "collector loop stopped");
                    break;
                }
                // Runs to completion; shutdown is only observed between ticks.
                _ = ticker.tick() => run_tick(&ctx, kind, interval).await,
            }
        }
    })
}

/// One pass of `kind`, recorded in metrics and loop health. A tick longer
/// than `interval` is logged as an overrun.
async fn run_tick(ctx: &AppContext, kind: CollectorLoop, interval: Duration) {
    let loop_name = kind.name();
    let started = Instant::now();
    let outcome = kind.run(ctx).await;
    let elapsed = started.elapsed();

    ctx.metrics.observe_duration(loop_name, elapsed);
    ctx.metrics.record_success(loop_name, outcome.is_ok());

    match outcome {
        Ok(()) => {
            if elapsed > interval {
                warn!(loop_name, elapsed = ?elapsed, interval = ?interval, "collector tick overran its interval");
            } else {
                info!(loop_name, elapsed = ?elapsed, "collector tick completed");
            }
            ctx.state.record_loop_success(loop_name).await;
        }
        Err(err) => {
            error!(loop_name, error = ?err, "collector tick failed");
            ctx.metrics.inc_error(loop_name);
            ctx.state
                .record_loop_failure(loop_name, format!("{err:#}"))
                .await;
        }
    }
}

/// Collect, publish and analyze a snapshot for every registered cluster.
#[instrument(skip_all)]
pub async fn run_metrics(ctx: &AppContext) -> Result<()> {
    let mut ids = ctx.registry.list_cluster_ids().await;
    ids.sort();
    for gone in ctx.state.retain_clusters(&ids).await {
        debug!(cluster = %gone, "dropping series for deregistered cluster");
        ctx.metrics.remove_cluster(&gone);
    }

    for id in &ids {
        let snapshot = match ctx.collector.collect_cluster_metrics(id).await {
            Ok(snapshot) => snapshot,
            Err(MonitorError::NotFound(_)) => {
                debug!(cluster = %id, "cluster removed during tick");
                ctx.metrics.remove_cluster(id);
                continue;
            }
            Err(err) => {
                warn!(cluster = %id, error = %err, "metrics collection failed");
                continue;
            }
        };

        ctx.metrics.set_snapshot_metrics(&snapshot);
        if let Ok(stats) = ctx.registry.stats(id).await {
            ctx.metrics.set_pool_metrics(id, &stats);
        }

        for alert in ctx.analyzer.analyze_metrics(&snapshot) {
            ctx.metrics
                .inc_alert(&alert.cluster_id, alert.category, alert.severity);
            if alert.severity >= AlertSeverity::High {
                warn!(
                    cluster = %alert.cluster_id,
                    metric = %alert.metric,
                    severity = alert.severity.as_str(),
                    current_value = alert.current_value,
                    threshold = alert.threshold,
                    "{}", alert.message
                );
            } else {
                info!(
                    cluster = %alert.cluster_id,
                    metric = %alert.metric,
                    severity = alert.severity.as_str(),
                    "{}", alert.message
                );
            }
        }

        ctx.state.store_snapshot(snapshot).await;
        debug!(cluster = %id, "metrics tick complete");
    }

    Ok(())
}

/// Refresh topology for every registered cluster; fails when none is reachable.
#[instrument(skip_all)]
pub async fn run_cluster_info(ctx: &AppContext) -> Result<()> {
    let mut ids = ctx.registry.list_cluster_ids().await;
    ids.sort();

    let mut healthy = 0usize;
    for id in &ids {
        match ctx.cluster_info.refresh_cluster(id).await {
            Ok(status) => {
                ctx.metrics.set_cluster_status(id, status);
                if status == ClusterStatus::Healthy {
                    healthy += 1;
                }
            }
            Err(MonitorError::NotFound(_)) => {
                debug!(cluster = %id, "cluster removed during tick");
            }
            Err(err) => {
                warn!(cluster = %id, error = %err, "cluster info refresh failed");
                ctx.metrics.set_cluster_status(id, ClusterStatus::Unknown);
            }
        }
    }

    if !ids.is_empty() && healthy == 0 {
        bail!("none of the {} registered clusters passed its health check", ids.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ClusterEndpoint, Timeouts};
    use crate::metrics::AppMetrics;
    use crate::registry::ConnectionRegistry;
    use crate::state::SharedState;

    fn unreachable_fleet() -> AppContext {
        let limit = Duration::from_millis(200);
        let config = AppConfig {
            timeouts: Timeouts {
                probe: limit,
                health_check: limit,
                query: limit,
                ..Timeouts::default()
            },
            ..AppConfig::default()
        };
        let registry = ConnectionRegistry::new(config.timeouts.clone(), true);
        let metrics = AppMetrics::new().expect("metrics");
        AppContext::new(config, registry, metrics, SharedState::new())
    }

    fn refused(id: &str) -> ClusterEndpoint {
        // Port 1 on loopback refuses connections immediately.
        let mut endpoint = ClusterEndpoint::new(id, "127.0.0.1", 1, "monitor", "postgres");
        endpoint.min_connections = Some(0);
        endpoint
    }

    #[tokio::test]
    async fn unreachable_clusters_get_zeroed_snapshots_in_one_tick() {
        let ctx = unreachable_fleet();
        for id in ["a", "b"] {
            ctx.registry.insert_unprobed(refused(id)).await.expect("insert");
        }

        run_metrics(&ctx).await.expect("tick completes");

        for id in ["a", "b"] {
            let snapshot = ctx
                .state
                .latest_snapshot(id)
                .await
                .unwrap_or_else(|| panic!("no snapshot stored for {id}"));
            assert_eq!(snapshot.connections_active, 0);
            assert_eq!(snapshot.connections_total, 0);
            assert_eq!(snapshot.cache_hit_ratio, 0.0);
            assert_eq!(snapshot.replication_lag_ms, 0);
            assert_eq!(snapshot.disk_io_read, 0.0);
        }

        let live = ctx
            .collector
            .get_metrics_snapshot("a")
            .await
            .expect("registered cluster yields a snapshot");
        assert_eq!(live.cluster_id, "a");
        assert_eq!(live.connections_total, 0);
    }

    #[tokio::test]
    async fn failed_queries_surface_as_query_errors() {
        let ctx = unreachable_fleet();
        ctx.registry.insert_unprobed(refused("a")).await.expect("insert");
        let pool = ctx.registry.get_pool("a").await.expect("pool");
        let source = PgStatsSource::new("a", pool, Duration::from_millis(200), true);

        let err = source.cache_hit_ratio().await.expect_err("no server");
        assert!(
            matches!(err, MonitorError::Query { query: "cache_hit_ratio", .. }),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn deregistered_cluster_series_are_dropped_on_next_tick() {
        let ctx = unreachable_fleet();
        for id in ["a", "b"] {
            ctx.registry.insert_unprobed(refused(id)).await.expect("insert");
        }
        run_metrics(&ctx).await.expect("first tick");
        let gauge = "pgfleet_pg_connections_active{cluster=\"b\"}";
        assert!(ctx.metrics.encode().expect("encode").contains(gauge));

        ctx.registry.remove_cluster("b").await.expect("remove");
        run_metrics(&ctx).await.expect("second tick");

        assert!(ctx.state.latest_snapshot("b").await.is_none());
        assert!(ctx.state.latest_snapshot("a").await.is_some());
        let output = ctx.metrics.encode().expect("encode");
        assert!(!output.contains(gauge), "stale series left: {output}");
        assert!(output.contains("pgfleet_pg_connections_active{cluster=\"a\"}"));
    }

    #[tokio::test]
    async fn cluster_info_tick_fails_when_no_cluster_is_healthy() {
        let ctx = unreachable_fleet();
        ctx.registry.insert_unprobed(refused("a")).await.expect("insert");

        run_tick(&ctx, CollectorLoop::ClusterInfo, Duration::from_secs(60)).await;

        let health = ctx.state.loop_health().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].name, CLUSTER_INFO_LOOP);
        assert_eq!(health[0].consecutive_failures, 1);
        assert_eq!(
            ctx.cluster_info.get_cluster("a").await.map(|info| info.status).ok(),
            Some(ClusterStatus::Unhealthy)
        );
    }
}
