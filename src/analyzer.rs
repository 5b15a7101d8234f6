use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::alert::{
    Alert, AlertCategory, AlertSeverity, AlertStatus, CheckStatus, HealthCheck, HealthStatus,
};
use crate::config::PerformanceThresholds;
use crate::model::{MetricsSnapshot, QueryMetrics};

const CONNECTION_TIERS: (f64, f64) = (90.0, 95.0);
const CACHE_TIERS: (f64, f64) = (90.0, 85.0);
const CPU_TIERS: (f64, f64) = (90.0, 95.0);
const MEMORY_TIERS: (f64, f64) = (90.0, 95.0);
const REPLICATION_LAG_TIERS_MS: (f64, f64) = (30_000.0, 60_000.0);
const BLOAT_TIERS: (f64, f64) = (30.0, 40.0);

const LOCK_WAIT_LIMIT: i64 = 100;
const TEMP_BLOCK_LIMIT: i64 = 10_000;
const SLOW_QUERY_HIGH_FACTOR: f64 = 5.0;
const SLOW_QUERY_CRITICAL_FACTOR: f64 = 10.0;

/// Converts snapshots into alerts and health scores. Holds no state besides
/// its thresholds, so repeated calls on the same input agree.
#[derive(Debug, Clone, Default)]
pub struct PerformanceAnalyzer {
    thresholds: PerformanceThresholds,
}

impl PerformanceAnalyzer {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self { thresholds }
    }

    /// At most one alert per check, in check order.
    pub fn analyze_metrics(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let t = &self.thresholds;
        let cluster = snapshot.cluster_id.as_str();
        let at = snapshot.collected_at;
        let mut alerts = Vec::new();

        if snapshot.connections_total > 0 {
            let pct = snapshot.connection_utilization();
            if pct > t.max_connections_percent {
                alerts.push(
                    new_alert(
                        AlertCategory::Connection,
                        tier_above(pct, t.max_connections_percent, CONNECTION_TIERS),
                        cluster,
                        "connections_active",
                        at,
                    )
                    .titled(
                        "High Connection Usage",
                        format!("Active connections at {pct:.1}% of maximum capacity"),
                    )
                    .measured(t.max_connections_percent, pct)
                    .action("Consider increasing max_connections or optimizing connection pooling"),
                );
            }
        }

        if snapshot.cache_hit_ratio < t.min_cache_hit_ratio {
            let ratio = snapshot.cache_hit_ratio;
            alerts.push(
                new_alert(
                    AlertCategory::Performance,
                    tier_below(ratio, t.min_cache_hit_ratio, CACHE_TIERS),
                    cluster,
                    "cache_hit_ratio",
                    at,
                )
                .titled(
                    "Low Cache Hit Ratio",
                    format!(
                        "Cache hit ratio at {ratio:.1}%, below recommended {:.1}%",
                        t.min_cache_hit_ratio
                    ),
                )
                .measured(t.min_cache_hit_ratio, ratio)
                .action("Consider increasing shared_buffers")
                .action("Review query patterns for optimization"),
            );
        }

        if snapshot.cpu_usage > t.max_cpu_percent {
            let cpu = snapshot.cpu_usage;
            alerts.push(
                new_alert(
                    AlertCategory::Performance,
                    tier_above(cpu, t.max_cpu_percent, CPU_TIERS),
                    cluster,
                    "cpu_usage",
                    at,
                )
                .titled("High CPU Usage", format!("CPU usage at {cpu:.1}%"))
                .measured(t.max_cpu_percent, cpu)
                .action("Identify and optimize expensive queries")
                .action("Consider scaling up the instance"),
            );
        }

        if snapshot.memory_usage > t.max_memory_percent {
            let memory = snapshot.memory_usage;
            alerts.push(
                new_alert(
                    AlertCategory::Capacity,
                    tier_above(memory, t.max_memory_percent, MEMORY_TIERS),
                    cluster,
                    "memory_usage",
                    at,
                )
                .titled("High Memory Usage", format!("Memory usage at {memory:.1}%"))
                .measured(t.max_memory_percent, memory)
                .action("Review and optimize memory-intensive queries")
                .action("Consider increasing available memory"),
            );
        }

        if snapshot.replication_lag_ms > t.max_replication_lag_ms {
            let lag = snapshot.replication_lag_ms as f64;
            let threshold = t.max_replication_lag_ms as f64;
            alerts.push(
                new_alert(
                    AlertCategory::Replication,
                    tier_above(lag, threshold, REPLICATION_LAG_TIERS_MS),
                    cluster,
                    "replication_lag",
                    at,
                )
                .titled(
                    "High Replication Lag",
                    format!("Replication lag at {}ms", snapshot.replication_lag_ms),
                )
                .measured(threshold, lag)
                .action("Check network connectivity between primary and replica")
                .action("Review write load on primary"),
            );
        }

        if snapshot.lock_waits > LOCK_WAIT_LIMIT {
            alerts.push(
                new_alert(
                    AlertCategory::Performance,
                    AlertSeverity::Medium,
                    cluster,
                    "lock_waits",
                    at,
                )
                .titled(
                    "High Lock Waits",
                    format!("{} queries waiting for locks", snapshot.lock_waits),
                )
                .measured(LOCK_WAIT_LIMIT as f64, snapshot.lock_waits as f64)
                .action("Review long-running transactions")
                .action("Optimize query access patterns"),
            );
        }

        if snapshot.deadlock_count > 0 {
            alerts.push(
                new_alert(
                    AlertCategory::Performance,
                    AlertSeverity::High,
                    cluster,
                    "deadlock_count",
                    at,
                )
                .titled(
                    "Deadlocks Detected",
                    format!("{} deadlocks detected", snapshot.deadlock_count),
                )
                .measured(0.0, snapshot.deadlock_count as f64)
                .action("Review transaction ordering")
                .action("Consider implementing retry logic"),
            );
        }

        if snapshot.table_bloat_pct > t.max_table_bloat_percent {
            let bloat = snapshot.table_bloat_pct;
            alerts.push(
                new_alert(
                    AlertCategory::Capacity,
                    tier_above(bloat, t.max_table_bloat_percent, BLOAT_TIERS),
                    cluster,
                    "table_bloat",
                    at,
                )
                .titled("High Table Bloat", format!("Table bloat at {bloat:.1}%"))
                .measured(t.max_table_bloat_percent, bloat)
                .action("Run VACUUM ANALYZE")
                .action("Consider VACUUM FULL for heavily bloated tables"),
            );
        }

        alerts
    }

    /// Slow-execution and temp-spill alerts for one statement.
    pub fn analyze_query_performance(&self, query: &QueryMetrics) -> Vec<Alert> {
        let limit = self.thresholds.max_slow_query_ms;
        let cluster = query.cluster_id.as_str();
        let at = query.collected_at;
        let mut alerts = Vec::new();

        if query.execution_time_ms > limit {
            let severity = if query.execution_time_ms > limit * SLOW_QUERY_CRITICAL_FACTOR {
                AlertSeverity::Critical
            } else if query.execution_time_ms > limit * SLOW_QUERY_HIGH_FACTOR {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            };

            let mut alert = new_alert(
                AlertCategory::Query,
                severity,
                cluster,
                &format!("execution_time:{}", query.query_id),
                at,
            )
            .titled(
                "Slow Query Detected",
                format!("Query took {:.2}ms to execute", query.execution_time_ms),
            )
            .measured(limit, query.execution_time_ms)
            .action("Analyze query with EXPLAIN ANALYZE")
            .action("Check for missing indexes")
            .action("Consider query optimization");
            alert.metric = "execution_time".to_string();
            alert.metadata = BTreeMap::from([
                ("query_id".to_string(), json!(query.query_id)),
                ("database".to_string(), json!(query.database)),
            ]);
            alerts.push(alert);
        }

        if query.temp_blocks_read > TEMP_BLOCK_LIMIT || query.temp_blocks_written > TEMP_BLOCK_LIMIT {
            let mut alert = new_alert(
                AlertCategory::Performance,
                AlertSeverity::Medium,
                cluster,
                &format!("temp_blocks:{}", query.query_id),
                at,
            )
            .titled(
                "High Temp Block Usage",
                format!(
                    "Query using excessive temp blocks (read: {}, written: {})",
                    query.temp_blocks_read, query.temp_blocks_written
                ),
            )
            .measured(
                TEMP_BLOCK_LIMIT as f64,
                query.temp_blocks_read.max(query.temp_blocks_written) as f64,
            )
            .action("Consider increasing work_mem")
            .action("Optimize sort and hash operations");
            alert.metric = "temp_blocks".to_string();
            alert.metadata = BTreeMap::from([
                ("query_id".to_string(), json!(query.query_id)),
                ("temp_blocks_read".to_string(), json!(query.temp_blocks_read)),
                ("temp_blocks_written".to_string(), json!(query.temp_blocks_written)),
            ]);
            alerts.push(alert);
        }

        alerts
    }

    /// Named checks against the same thresholds, scored by the share that pass.
    pub fn generate_health_status(
        &self,
        cluster_id: &str,
        snapshot: &MetricsSnapshot,
        alerts: &[Alert],
    ) -> HealthStatus {
        let t = &self.thresholds;
        let mut health = HealthStatus::new(cluster_id);

        for alert in alerts.iter().filter(|alert| alert.is_active()) {
            health.active_alerts += 1;
            if alert.severity == AlertSeverity::Critical {
                health.critical_alerts += 1;
            }
        }

        health.add_check(HealthCheck::new(
            "Database Connectivity",
            CheckStatus::Ok,
            "Database is reachable",
        ));

        if snapshot.connections_total > 0 {
            let pct = snapshot.connection_utilization();
            health.add_check(
                HealthCheck::new(
                    "Connection Pool",
                    warn_if(pct > t.max_connections_percent),
                    format!("{pct:.1}% connections in use"),
                )
                .with_value(pct),
            );
        }

        health.add_check(
            HealthCheck::new(
                "Cache Performance",
                warn_if(snapshot.cache_hit_ratio < t.min_cache_hit_ratio),
                format!("{:.1}% cache hit ratio", snapshot.cache_hit_ratio),
            )
            .with_value(snapshot.cache_hit_ratio),
        );

        health.add_check(
            HealthCheck::new(
                "CPU Usage",
                warn_if(snapshot.cpu_usage > t.max_cpu_percent),
                format!("{:.1}% CPU usage", snapshot.cpu_usage),
            )
            .with_value(snapshot.cpu_usage),
        );

        health.add_check(
            HealthCheck::new(
                "Memory Usage",
                warn_if(snapshot.memory_usage > t.max_memory_percent),
                format!("{:.1}% memory usage", snapshot.memory_usage),
            )
            .with_value(snapshot.memory_usage),
        );

        health.add_check(
            HealthCheck::new(
                "Replication Lag",
                warn_if(snapshot.replication_lag_ms > t.max_replication_lag_ms),
                format!("{}ms replication lag", snapshot.replication_lag_ms),
            )
            .with_value(snapshot.replication_lag_ms as f64),
        );

        health.add_check(
            HealthCheck::new(
                "Table Bloat",
                warn_if(snapshot.table_bloat_pct > t.max_table_bloat_percent),
                format!("{:.1}% average table bloat", snapshot.table_bloat_pct),
            )
            .with_value(snapshot.table_bloat_pct),
        );

        health
    }
}

fn warn_if(breached: bool) -> CheckStatus {
    if breached {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

/// Higher is worse: `>= critical`, `>= high`, `>= warning`, else low.
pub fn tier_above(value: f64, warning: f64, (high, critical): (f64, f64)) -> AlertSeverity {
    if value >= critical {
        AlertSeverity::Critical
    } else if value >= high {
        AlertSeverity::High
    } else if value >= warning {
        AlertSeverity::Medium
    } else {
        AlertSeverity::Low
    }
}

/// Lower is worse: `<= critical`, `<= high`, `<= warning`, else low.
pub fn tier_below(value: f64, warning: f64, (high, critical): (f64, f64)) -> AlertSeverity {
    if value <= critical {
        AlertSeverity::Critical
    } else if value <= high {
        AlertSeverity::High
    } else if value <= warning {
        AlertSeverity::Medium
    } else {
        AlertSeverity::Low
    }
}

fn new_alert(
    category: AlertCategory,
    severity: AlertSeverity,
    cluster_id: &str,
    metric: &str,
    raised_at: DateTime<Utc>,
) -> Alert {
    Alert {
        id: format!("{cluster_id}:{metric}"),
        category,
        severity,
        cluster_id: cluster_id.to_string(),
        title: String::new(),
        message: String::new(),
        metric: metric.to_string(),
        threshold: 0.0,
        current_value: 0.0,
        raised_at,
        status: AlertStatus::Active,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: None,
        metadata: BTreeMap::new(),
        actions: Vec::new(),
    }
}

trait AlertExt {
    fn titled(self, title: &str, message: String) -> Self;
    fn measured(self, threshold: f64, current_value: f64) -> Self;
    fn action(self, action: &str) -> Self;
}

impl AlertExt for Alert {
    fn titled(mut self, title: &str, message: String) -> Self {
        self.title = title.to_string();
        self.message = message;
        self
    }

    fn measured(mut self, threshold: f64, current_value: f64) -> Self {
        self.threshold = threshold;
        self.current_value = current_value;
        self
    }

    fn action(mut self, action: &str) -> Self {
        self.actions.push(action.to_string());
        self
    }
}
