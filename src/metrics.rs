use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::alert::{AlertCategory, AlertSeverity};
use crate::model::{ClusterStatus, MetricsSnapshot};
use crate::registry::PoolStats;

/// Self-observability registry scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    snapshot: SnapshotMetrics,
    pools: PoolMetrics,
    clusters: ClusterMetrics,
    alert_counters: AlertCounters,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("pgfleet".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let snapshot = SnapshotMetrics::register(&registry)?;
        let pools = PoolMetrics::register(&registry)?;
        let clusters = ClusterMetrics::register(&registry)?;
        let alert_counters = AlertCounters::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            snapshot,
            pools,
            clusters,
            alert_counters,
        })
    }

    /// Observe the execution duration for a loop.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .scrape_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for a loop iteration (1=success, 0=failed).
    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(if success { 1 } else { 0 });
    }

    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    /// Publish the headline fields of a freshly collected snapshot.
    pub fn set_snapshot_metrics(&self, snapshot: &MetricsSnapshot) {
        let cluster = sanitize_label(&snapshot.cluster_id);
        let labels = &[cluster.as_str()];
        let s = &self.snapshot;

        s.connections_active
            .with_label_values(labels)
            .set(snapshot.connections_active);
        s.max_connections
            .with_label_values(labels)
            .set(snapshot.connections_total);
        s.cache_hit_ratio
            .with_label_values(labels)
            .set(snapshot.cache_hit_ratio);
        s.transactions_per_second
            .with_label_values(labels)
            .set(snapshot.transactions_per_sec);
        s.lock_waits
            .with_label_values(labels)
            .set(snapshot.lock_waits);
        s.deadlocks
            .with_label_values(labels)
            .set(snapshot.deadlock_count);
        s.replication_lag_seconds
            .with_label_values(labels)
            .set(snapshot.replication_lag_ms as f64 / 1_000.0);
        s.table_bloat_pct
            .with_label_values(labels)
            .set(snapshot.table_bloat_pct);
        s.disk_read_kb
            .with_label_values(labels)
            .set(snapshot.disk_io_read);
        s.disk_write_kb
            .with_label_values(labels)
            .set(snapshot.disk_io_write);
    }

    pub fn set_pool_metrics(&self, cluster: &str, stats: &PoolStats) {
        let cluster = sanitize_label(cluster);
        let labels = &[cluster.as_str()];
        self.pools
            .in_use
            .with_label_values(labels)
            .set(i64::from(stats.in_use));
        self.pools
            .idle
            .with_label_values(labels)
            .set(i64::from(stats.idle));
        self.pools
            .max
            .with_label_values(labels)
            .set(i64::from(stats.max));
    }

    pub fn set_cluster_status(&self, cluster: &str, status: ClusterStatus) {
        let cluster = sanitize_label(cluster);
        self.clusters
            .up
            .with_label_values(&[cluster.as_str()])
            .set(if status == ClusterStatus::Healthy { 1 } else { 0 });
    }

    /// Forget every per-cluster series for a cluster that left the fleet.
    pub fn remove_cluster(&self, cluster: &str) {
        let cluster = sanitize_label(cluster);
        let labels = &[cluster.as_str()];
        let s = &self.snapshot;
        let _ = s.connections_active.remove_label_values(labels);
        let _ = s.max_connections.remove_label_values(labels);
        let _ = s.cache_hit_ratio.remove_label_values(labels);
        let _ = s.transactions_per_second.remove_label_values(labels);
        let _ = s.lock_waits.remove_label_values(labels);
        let _ = s.deadlocks.remove_label_values(labels);
        let _ = s.replication_lag_seconds.remove_label_values(labels);
        let _ = s.table_bloat_pct.remove_label_values(labels);
        let _ = s.disk_read_kb.remove_label_values(labels);
        let _ = s.disk_write_kb.remove_label_values(labels);
        let _ = self.pools.in_use.remove_label_values(labels);
        let _ = self.pools.idle.remove_label_values(labels);
        let _ = self.pools.max.remove_label_values(labels);
        let _ = self.clusters.up.remove_label_values(labels);
    }

    pub fn inc_alert(&self, cluster: &str, category: AlertCategory, severity: AlertSeverity) {
        let cluster = sanitize_label(cluster);
        self.alert_counters
            .alerts_total
            .with_label_values(&[cluster.as_str(), category.as_str(), severity.as_str()])
            .inc();
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    scrape_duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Collector loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "loop_last_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("loop_errors_total", "Total loop errors"),
            &["loop"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            scrape_duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct SnapshotMetrics {
    connections_active: IntGaugeVec,
    max_connections: IntGaugeVec,
    cache_hit_ratio: GaugeVec,
    transactions_per_second: GaugeVec,
    lock_waits: IntGaugeVec,
    deadlocks: IntGaugeVec,
    replication_lag_seconds: GaugeVec,
    table_bloat_pct: GaugeVec,
    disk_read_kb: GaugeVec,
    disk_write_kb: GaugeVec,
}

impl SnapshotMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let int_gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["cluster"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let gauge = |name: &str, help: &str| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help), &["cluster"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            connections_active: int_gauge("pg_connections_active", "Active backends observed")?,
            max_connections: int_gauge("pg_max_connections", "Postgres max_connections setting")?,
            cache_hit_ratio: gauge(
                "pg_cache_hit_ratio_percent",
                "Buffer cache hit ratio of the monitored database",
            )?,
            transactions_per_second: gauge(
                "pg_transactions_per_second",
                "Estimated transactions per second",
            )?,
            lock_waits: int_gauge("pg_lock_waits", "Lock requests not yet granted")?,
            deadlocks: int_gauge("pg_deadlocks_total", "Deadlocks recorded since stats reset")?,
            replication_lag_seconds: gauge(
                "pg_replication_lag_seconds",
                "Replay lag observed on a standby (0 on primaries)",
            )?,
            table_bloat_pct: gauge(
                "pg_table_bloat_percent",
                "Average dead/live tuple percentage across user tables",
            )?,
            disk_read_kb: gauge("pg_disk_read_kilobytes", "Blocks read from disk, in KB")?,
            disk_write_kb: gauge(
                "pg_disk_write_kilobytes",
                "Tuple writes expressed as 8 KB blocks",
            )?,
        })
    }
}

#[derive(Clone)]
struct PoolMetrics {
    in_use: IntGaugeVec,
    idle: IntGaugeVec,
    max: IntGaugeVec,
}

impl PoolMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let in_use = IntGaugeVec::new(
            Opts::new("pool_connections_in_use", "Pooled connections checked out"),
            &["cluster"],
        )?;
        registry.register(Box::new(in_use.clone()))?;

        let idle = IntGaugeVec::new(
            Opts::new("pool_connections_idle", "Pooled connections idle"),
            &["cluster"],
        )?;
        registry.register(Box::new(idle.clone()))?;

        let max = IntGaugeVec::new(
            Opts::new("pool_connections_max", "Configured pool size limit"),
            &["cluster"],
        )?;
        registry.register(Box::new(max.clone()))?;

        Ok(Self { in_use, idle, max })
    }
}

#[derive(Clone)]
struct ClusterMetrics {
    up: IntGaugeVec,
}

impl ClusterMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let up = IntGaugeVec::new(
            Opts::new("cluster_up", "Cluster passed its last health check (1) or not (0)"),
            &["cluster"],
        )?;
        registry.register(Box::new(up.clone()))?;
        Ok(Self { up })
    }
}

#[derive(Clone)]
struct AlertCounters {
    alerts_total: IntCounterVec,
}

impl AlertCounters {
    fn register(registry: &Registry) -> Result<Self> {
        let alerts_total = IntCounterVec::new(
            Opts::new(
                "alerts_total",
                "Total emitted alerts grouped by category and severity",
            ),
            &["cluster", "category", "severity"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;
        Ok(Self { alerts_total })
    }
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == ':' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
