use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time metrics for one cluster.
///
/// Every field is either freshly sampled or zero when its sub-collection
/// failed during the pass that produced the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cluster_id: String,
    #[serde(rename = "timestamp")]
    pub collected_at: DateTime<Utc>,
    pub connections_active: i64,
    pub connections_total: i64,
    pub transactions_per_sec: f64,
    pub cache_hit_ratio: f64,
    /// KB read since stats reset.
    pub disk_io_read: f64,
    /// KB written since stats reset.
    pub disk_io_write: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub lock_waits: i64,
    pub deadlock_count: i64,
    pub replication_lag_ms: i64,
    pub table_bloat_pct: f64,
}

impl MetricsSnapshot {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self::at(cluster_id, Utc::now())
    }

    pub fn at(cluster_id: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            collected_at,
            connections_active: 0,
            connections_total: 0,
            transactions_per_sec: 0.0,
            cache_hit_ratio: 0.0,
            disk_io_read: 0.0,
            disk_io_write: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            lock_waits: 0,
            deadlock_count: 0,
            replication_lag_ms: 0,
            table_bloat_pct: 0.0,
        }
    }

    /// Active sessions as a percentage of `max_connections`; zero when unknown.
    pub fn connection_utilization(&self) -> f64 {
        if self.connections_total > 0 {
            self.connections_active as f64 * 100.0 / self.connections_total as f64
        } else {
            0.0
        }
    }
}

/// One `pg_stat_statements` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query_id: String,
    /// `None` when SQL text is redacted.
    pub query: Option<String>,
    pub cluster_id: String,
    pub database: Option<String>,
    pub calls: i64,
    /// Mean execution time per call.
    pub execution_time_ms: f64,
    pub total_exec_time_ms: f64,
    pub stddev_exec_time_ms: f64,
    pub planning_time_ms: f64,
    pub rows_returned: i64,
    pub shared_blocks_hit: i64,
    pub shared_blocks_read: i64,
    pub temp_blocks_read: i64,
    pub temp_blocks_written: i64,
    #[serde(rename = "timestamp")]
    pub collected_at: DateTime<Utc>,
}

impl QueryMetrics {
    pub fn new(query_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            query: None,
            cluster_id: cluster_id.into(),
            database: None,
            calls: 0,
            execution_time_ms: 0.0,
            total_exec_time_ms: 0.0,
            stddev_exec_time_ms: 0.0,
            planning_time_ms: 0.0,
            rows_returned: 0,
            shared_blocks_hit: 0,
            shared_blocks_read: 0,
            temp_blocks_read: 0,
            temp_blocks_written: 0,
            collected_at: Utc::now(),
        }
    }
}

/// One `pg_stat_user_tables` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetrics {
    pub cluster_id: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub seq_scan: i64,
    pub seq_tup_read: i64,
    pub idx_scan: i64,
    pub idx_tup_fetch: i64,
    pub tup_inserted: i64,
    pub tup_updated: i64,
    pub tup_deleted: i64,
    pub tup_hot_updated: i64,
    pub live_tuples: i64,
    pub dead_tuples: i64,
    pub vacuum_count: i64,
    pub autovacuum_count: i64,
    pub analyze_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_vacuum: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_autovacuum: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_analyze: Option<DateTime<Utc>>,
    #[serde(rename = "timestamp")]
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Last known topology and configuration of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: String,
    pub name: String,
    pub status: ClusterStatus,
    pub configuration: ClusterConfiguration,
    pub updated_at: DateTime<Utc>,
}

impl ClusterInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ClusterStatus::Unknown,
            configuration: ClusterConfiguration::default(),
            updated_at: Utc::now(),
        }
    }
}

/// Configuration bag refreshed by the cluster info loop.
///
/// Fields stay `None` until first collected and keep their previous value when
/// a later refresh of that field fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<BTreeMap<String, SettingValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub databases: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub is_primary: bool,
    pub replicas: Vec<ReplicaStatus>,
}

/// One row of `pg_stat_replication` as seen from the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub application_name: String,
    pub client_addr: Option<String>,
    pub state: Option<String>,
    pub sync_state: Option<String>,
    pub sync_priority: i32,
    pub lag_ms: Option<i64>,
    pub lag_bytes: Option<i64>,
    pub uptime_seconds: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_is_zero_without_max_connections() {
        let mut snapshot = MetricsSnapshot::new("a");
        snapshot.connections_active = 10;
        assert_eq!(snapshot.connection_utilization(), 0.0);

        snapshot.connections_total = 40;
        assert_eq!(snapshot.connection_utilization(), 25.0);
    }

    #[test]
    fn snapshot_serializes_with_wire_field_names() {
        let snapshot = MetricsSnapshot::new("a");
        let value = serde_json::to_value(&snapshot).expect("serialize");
        for key in [
            "cluster_id",
            "timestamp",
            "connections_active",
            "connections_total",
            "transactions_per_sec",
            "cache_hit_ratio",
            "disk_io_read",
            "disk_io_write",
            "lock_waits",
            "deadlock_count",
            "replication_lag_ms",
            "table_bloat_pct",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn configuration_flattens_extra_labels_and_skips_unset_fields() {
        let mut config = ClusterConfiguration::default();
        config
            .extra
            .insert("region".into(), serde_json::json!("eu-west-1"));
        config.version = Some("PostgreSQL 16.2".into());

        let value = serde_json::to_value(&config).expect("serialize");
        assert_eq!(value["region"], "eu-west-1");
        assert_eq!(value["version"], "PostgreSQL 16.2");
        assert!(value.get("settings").is_none());
    }
}
