use std::fmt::Display;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::collector::source::{PgStatsSource, StatsSource};
use crate::config::{AppConfig, Limits};
use crate::error::{MonitorError, Result};
use crate::model::{MetricsSnapshot, QueryMetrics, TableMetrics};
use crate::registry::ConnectionRegistry;

/// Divisor turning the cumulative transaction counter into a per-second figure.
const TPS_WINDOW_SECS: f64 = 60.0;
const BLOCK_SIZE_KB: f64 = 8.0;

/// Runs the statistics battery against registered clusters.
#[derive(Clone)]
pub struct MetricsCollector {
    registry: ConnectionRegistry,
    limits: Limits,
    query_timeout: Duration,
    redact_sql: bool,
}

impl MetricsCollector {
    pub fn new(registry: ConnectionRegistry, config: &AppConfig) -> Self {
        Self {
            registry,
            limits: config.limits.clone(),
            query_timeout: config.timeouts.query,
            redact_sql: config.security.redact_sql_text,
        }
    }

    async fn source(&self, cluster_id: &str) -> Result<PgStatsSource> {
        let pool = self.registry.get_pool(cluster_id).await?;
        Ok(PgStatsSource::new(
            cluster_id,
            pool,
            self.query_timeout,
            self.redact_sql,
        ))
    }

    /// One full pass over the seven sub-collections for `cluster_id`.
    ///
    /// Only the pool lookup can fail; query failures zero their field.
    pub async fn collect_cluster_metrics(&self, cluster_id: &str) -> Result<MetricsSnapshot> {
        let source = self.source(cluster_id).await?;
        Ok(collect_snapshot(cluster_id, &source).await)
    }

    /// Live collection on behalf of a caller; never served from a cache.
    pub async fn get_metrics_snapshot(&self, cluster_id: &str) -> Result<MetricsSnapshot> {
        self.collect_cluster_metrics(cluster_id).await
    }

    /// Top statements by mean execution time, optionally for one database.
    pub async fn collect_query_metrics(
        &self,
        cluster_id: &str,
        database: Option<&str>,
    ) -> Result<Vec<QueryMetrics>> {
        let source = self.source(cluster_id).await?;
        source.query_stats(database, self.limits.top_queries).await
    }

    /// Busiest user tables of the database the cluster pool is connected to.
    pub async fn collect_table_metrics(
        &self,
        cluster_id: &str,
        database: Option<&str>,
    ) -> Result<Vec<TableMetrics>> {
        let endpoint = self.registry.endpoint(cluster_id).await?;
        if let Some(requested) = database {
            if requested != endpoint.database {
                return Err(MonitorError::Validation(format!(
                    "cluster {cluster_id} is connected to database {:?}; table statistics for {requested:?} are not available",
                    endpoint.database
                )));
            }
        }
        let source = self.source(cluster_id).await?;
        source.table_stats(self.limits.top_tables).await
    }
}

/// Assemble a snapshot from independent sub-collections.
#[instrument(skip_all, fields(cluster = %cluster_id))]
pub async fn collect_snapshot(cluster_id: &str, source: &dyn StatsSource) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::new(cluster_id);

    if let Some(counts) = isolate(cluster_id, "connections", source.connection_counts().await) {
        snapshot.connections_active = counts.active;
        snapshot.connections_total = counts.max;
    }

    if let Some(ratio) = isolate(cluster_id, "cache_hit_ratio", source.cache_hit_ratio().await) {
        snapshot.cache_hit_ratio = ratio;
    }

    if let Some(total) = isolate(cluster_id, "transactions", source.transaction_total().await) {
        snapshot.transactions_per_sec = total as f64 / TPS_WINDOW_SECS;
    }

    if let Some(waits) = isolate(cluster_id, "lock_waits", source.lock_waits().await) {
        snapshot.lock_waits = waits;
    }
    if let Some(deadlocks) = isolate(cluster_id, "deadlocks", source.deadlocks().await) {
        snapshot.deadlock_count = deadlocks;
    }

    if let Some(lag) = isolate(cluster_id, "replication_lag", source.replication_lag_ms().await) {
        snapshot.replication_lag_ms = lag;
    }

    if let Some(bloat) = isolate(cluster_id, "table_bloat", source.table_bloat_pct().await) {
        snapshot.table_bloat_pct = bloat;
    }

    if let Some(blocks) = isolate(cluster_id, "disk_io", source.disk_blocks().await) {
        snapshot.disk_io_read = blocks.read as f64 * BLOCK_SIZE_KB;
        snapshot.disk_io_write = blocks.written as f64 * BLOCK_SIZE_KB;
    }

    debug!(
        cluster = %cluster_id,
        connections_active = snapshot.connections_active,
        cache_hit_ratio = snapshot.cache_hit_ratio,
        "collected metrics snapshot"
    );
    snapshot
}

/// Log a failed sub-collection and drop its value.
pub(crate) fn isolate<T, E: Display>(
    cluster_id: &str,
    collection: &'static str,
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(cluster = %cluster_id, collection, error = %err, "sub-collection failed");
            None
        }
    }
}
