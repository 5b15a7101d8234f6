use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::collector::util::{is_missing_pg_stat_statements, normalize_query};
use crate::error::{MonitorError, Result};
use crate::model::{QueryMetrics, ReplicaStatus, ReplicationSummary, SettingValue, TableMetrics};

const CONNECTIONS_SQL: &str = r#"
SELECT
    (SELECT COUNT(*)::bigint FROM pg_stat_activity WHERE state = 'active') AS active,
    (SELECT setting::bigint FROM pg_settings WHERE name = 'max_connections') AS max_conn
"#;

const CACHE_HIT_RATIO_SQL: &str = r#"
SELECT
    COALESCE(sum(blks_hit) * 100.0 / NULLIF(sum(blks_hit) + sum(blks_read), 0), 0)::double precision
        AS cache_hit_ratio
FROM pg_stat_database
WHERE datname = current_database()
"#;

const TRANSACTIONS_SQL: &str = r#"
SELECT COALESCE(xact_commit + xact_rollback, 0)::bigint AS total_txn
FROM pg_stat_database
WHERE datname = current_database()
"#;

const LOCK_WAITS_SQL: &str = r#"
SELECT COUNT(*)::bigint AS lock_waits
FROM pg_locks
WHERE NOT granted
"#;

const DEADLOCKS_SQL: &str = r#"
SELECT COALESCE(deadlocks, 0)::bigint AS deadlocks
FROM pg_stat_database
WHERE datname = current_database()
"#;

const REPLICATION_LAG_SQL: &str = r#"
SELECT
    CASE
        WHEN pg_is_in_recovery() THEN
            COALESCE(EXTRACT(EPOCH FROM (NOW() - pg_last_xact_replay_timestamp())) * 1000, 0)
        ELSE 0
    END::bigint AS lag_ms
"#;

const TABLE_BLOAT_SQL: &str = r#"
SELECT
    COALESCE(AVG(
        CASE WHEN n_live_tup > 0
        THEN (n_dead_tup::float / n_live_tup::float) * 100
        ELSE 0 END
    ), 0)::double precision AS bloat_pct
FROM pg_stat_user_tables
"#;

const DISK_IO_SQL: &str = r#"
SELECT
    COALESCE(sum(blks_read), 0)::bigint AS blocks_read,
    COALESCE(sum(tup_inserted + tup_updated + tup_deleted), 0)::bigint AS blocks_written
FROM pg_stat_database
"#;

const VERSION_SQL: &str = "SELECT version() AS version";

const SETTINGS_SQL: &str = r#"
SELECT name, setting, unit
FROM pg_settings
WHERE name IN (
    'max_connections',
    'shared_buffers',
    'effective_cache_size',
    'maintenance_work_mem',
    'work_mem',
    'max_worker_processes',
    'max_parallel_workers',
    'wal_level',
    'max_wal_senders',
    'max_replication_slots'
)
ORDER BY name
"#;

const DATABASES_SQL: &str = r#"
SELECT datname
FROM pg_database
WHERE datistemplate = false
ORDER BY datname
"#;

const IN_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery() AS in_recovery";

const REPLICAS_SQL: &str = r#"
SELECT
    COALESCE(application_name, '') AS application_name,
    host(client_addr) AS client_addr,
    state,
    sync_state,
    COALESCE(sync_priority, 0)::int AS sync_priority,
    (EXTRACT(EPOCH FROM replay_lag) * 1000)::bigint AS lag_ms,
    pg_wal_lsn_diff(sent_lsn, replay_lsn)::bigint AS lag_bytes,
    EXTRACT(EPOCH FROM (NOW() - backend_start))::bigint AS uptime_seconds
FROM pg_stat_replication
ORDER BY application_name
"#;

const EXTENSIONS_SQL: &str = r#"
SELECT extname
FROM pg_extension
ORDER BY extname
"#;

const QUERY_STATS_SQL: &str = r#"
SELECT
    s.queryid::text AS queryid,
    s.query,
    d.datname,
    s.calls::bigint AS calls,
    s.total_exec_time::double precision AS total_exec_time,
    s.mean_exec_time::double precision AS mean_exec_time,
    s.stddev_exec_time::double precision AS stddev_exec_time,
    s.mean_plan_time::double precision AS mean_plan_time,
    s.rows::bigint AS rows,
    s.shared_blks_hit::bigint AS shared_blks_hit,
    s.shared_blks_read::bigint AS shared_blks_read,
    s.temp_blks_read::bigint AS temp_blks_read,
    s.temp_blks_written::bigint AS temp_blks_written
FROM pg_stat_statements s
LEFT JOIN pg_database d ON d.oid = s.dbid
WHERE $1::text IS NULL OR d.datname::text = $1::text
ORDER BY s.mean_exec_time DESC
LIMIT $2
"#;

const TABLE_STATS_SQL: &str = r#"
SELECT
    current_database() AS database,
    schemaname,
    relname,
    COALESCE(seq_scan, 0)::bigint AS seq_scan,
    COALESCE(seq_tup_read, 0)::bigint AS seq_tup_read,
    COALESCE(idx_scan, 0)::bigint AS idx_scan,
    COALESCE(idx_tup_fetch, 0)::bigint AS idx_tup_fetch,
    n_tup_ins::bigint AS n_tup_ins,
    n_tup_upd::bigint AS n_tup_upd,
    n_tup_del::bigint AS n_tup_del,
    n_tup_hot_upd::bigint AS n_tup_hot_upd,
    n_live_tup::bigint AS n_live_tup,
    n_dead_tup::bigint AS n_dead_tup,
    vacuum_count::bigint AS vacuum_count,
    autovacuum_count::bigint AS autovacuum_count,
    analyze_count::bigint AS analyze_count,
    last_vacuum,
    last_autovacuum,
    last_analyze
FROM pg_stat_user_tables
ORDER BY COALESCE(seq_scan, 0) + COALESCE(idx_scan, 0) DESC
LIMIT $1
"#;

/// Active sessions and the server's connection limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub active: i64,
    pub max: i64,
}

/// Cumulative block counters for the whole instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskBlocks {
    pub read: i64,
    pub written: i64,
}

/// Read-only statistics queries the collectors issue against one cluster.
///
/// Each method is one independent sub-collection so callers can isolate
/// failures per field.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn connection_counts(&self) -> Result<ConnectionCounts>;
    async fn cache_hit_ratio(&self) -> Result<f64>;
    async fn transaction_total(&self) -> Result<i64>;
    async fn lock_waits(&self) -> Result<i64>;
    async fn deadlocks(&self) -> Result<i64>;
    async fn replication_lag_ms(&self) -> Result<i64>;
    async fn table_bloat_pct(&self) -> Result<f64>;
    async fn disk_blocks(&self) -> Result<DiskBlocks>;

    async fn version(&self) -> Result<String>;
    async fn settings(&self) -> Result<BTreeMap<String, SettingValue>>;
    async fn databases(&self) -> Result<Vec<String>>;
    async fn replication_status(&self) -> Result<ReplicationSummary>;
    async fn extensions(&self) -> Result<Vec<String>>;

    async fn query_stats(&self, database: Option<&str>, limit: u32) -> Result<Vec<QueryMetrics>>;
    async fn table_stats(&self, limit: u32) -> Result<Vec<TableMetrics>>;
}

/// [`StatsSource`] backed by a registry pool; every query runs under `timeout`.
pub struct PgStatsSource {
    cluster_id: String,
    pool: PgPool,
    timeout: Duration,
    redact_sql: bool,
}

impl PgStatsSource {
    pub fn new(cluster_id: impl Into<String>, pool: PgPool, timeout: Duration, redact_sql: bool) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            pool,
            timeout,
            redact_sql,
        }
    }

    async fn bounded<T, F>(&self, name: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(MonitorError::query(name, err)),
            Err(_) => Err(MonitorError::query_timeout(name, self.timeout)),
        }
    }

    async fn fetch_one(&self, name: &'static str, sql: &'static str) -> Result<PgRow> {
        self.bounded(name, sqlx::query(sql).fetch_one(&self.pool)).await
    }

    async fn fetch_all(&self, name: &'static str, sql: &'static str) -> Result<Vec<PgRow>> {
        self.bounded(name, sqlx::query(sql).fetch_all(&self.pool)).await
    }
}

fn column<'r, T>(row: &'r PgRow, query: &'static str, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(|err| MonitorError::query(query, err))
}

#[async_trait]
impl StatsSource for PgStatsSource {
    async fn connection_counts(&self) -> Result<ConnectionCounts> {
        let row = self.fetch_one("connections", CONNECTIONS_SQL).await?;
        Ok(ConnectionCounts {
            active: column(&row, "connections", "active")?,
            max: column(&row, "connections", "max_conn")?,
        })
    }

    async fn cache_hit_ratio(&self) -> Result<f64> {
        let row = self.fetch_one("cache_hit_ratio", CACHE_HIT_RATIO_SQL).await?;
        column(&row, "cache_hit_ratio", "cache_hit_ratio")
    }

    async fn transaction_total(&self) -> Result<i64> {
        let row = self.fetch_one("transactions", TRANSACTIONS_SQL).await?;
        column(&row, "transactions", "total_txn")
    }

    async fn lock_waits(&self) -> Result<i64> {
        let row = self.fetch_one("lock_waits", LOCK_WAITS_SQL).await?;
        column(&row, "lock_waits", "lock_waits")
    }

    async fn deadlocks(&self) -> Result<i64> {
        let row = self.fetch_one("deadlocks", DEADLOCKS_SQL).await?;
        column(&row, "deadlocks", "deadlocks")
    }

    async fn replication_lag_ms(&self) -> Result<i64> {
        let row = self.fetch_one("replication_lag", REPLICATION_LAG_SQL).await?;
        column(&row, "replication_lag", "lag_ms")
    }

    async fn table_bloat_pct(&self) -> Result<f64> {
        let row = self.fetch_one("table_bloat", TABLE_BLOAT_SQL).await?;
        column(&row, "table_bloat", "bloat_pct")
    }

    async fn disk_blocks(&self) -> Result<DiskBlocks> {
        let row = self.fetch_one("disk_io", DISK_IO_SQL).await?;
        Ok(DiskBlocks {
            read: column(&row, "disk_io", "blocks_read")?,
            written: column(&row, "disk_io", "blocks_written")?,
        })
    }

    async fn version(&self) -> Result<String> {
        let row = self.fetch_one("version", VERSION_SQL).await?;
        column(&row, "version", "version")
    }

    async fn settings(&self) -> Result<BTreeMap<String, SettingValue>> {
        let rows = self.fetch_all("settings", SETTINGS_SQL).await?;
        let mut settings = BTreeMap::new();
        for row in rows {
            let name: String = column(&row, "settings", "name")?;
            let value: String = column(&row, "settings", "setting")?;
            let unit: Option<String> = column(&row, "settings", "unit")?;
            settings.insert(name, SettingValue { value, unit });
        }
        Ok(settings)
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let rows = self.fetch_all("databases", DATABASES_SQL).await?;
        rows.iter()
            .map(|row| column(row, "databases", "datname"))
            .collect()
    }

    async fn replication_status(&self) -> Result<ReplicationSummary> {
        let row = self.fetch_one("replication_role", IN_RECOVERY_SQL).await?;
        let in_recovery: bool = column(&row, "replication_role", "in_recovery")?;

        let rows = self.fetch_all("replication_status", REPLICAS_SQL).await?;
        let mut replicas = Vec::with_capacity(rows.len());
        for row in rows {
            replicas.push(ReplicaStatus {
                application_name: column(&row, "replication_status", "application_name")?,
                client_addr: column(&row, "replication_status", "client_addr")?,
                state: column(&row, "replication_status", "state")?,
                sync_state: column(&row, "replication_status", "sync_state")?,
                sync_priority: column(&row, "replication_status", "sync_priority")?,
                lag_ms: column(&row, "replication_status", "lag_ms")?,
                lag_bytes: column(&row, "replication_status", "lag_bytes")?,
                uptime_seconds: column(&row, "replication_status", "uptime_seconds")?,
            });
        }

        Ok(ReplicationSummary {
            is_primary: !in_recovery,
            replicas,
        })
    }

    async fn extensions(&self) -> Result<Vec<String>> {
        let rows = self.fetch_all("extensions", EXTENSIONS_SQL).await?;
        rows.iter()
            .map(|row| column(row, "extensions", "extname"))
            .collect()
    }

    async fn query_stats(&self, database: Option<&str>, limit: u32) -> Result<Vec<QueryMetrics>> {
        let fetch = sqlx::query(QUERY_STATS_SQL)
            .bind(database)
            .bind(i64::from(limit))
            .fetch_all(&self.pool);

        let rows = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) if is_missing_pg_stat_statements(&err) => {
                warn!(cluster = %self.cluster_id, "pg_stat_statements unavailable; query metrics disabled");
                return Ok(Vec::new());
            }
            Ok(Err(err)) => return Err(MonitorError::query("query_stats", err)),
            Err(_) => return Err(MonitorError::query_timeout("query_stats", self.timeout)),
        };

        let collected_at = Utc::now();
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let query_id: Option<String> = column(&row, "query_stats", "queryid")?;
            let mut entry = QueryMetrics::new(query_id.unwrap_or_default(), self.cluster_id.clone());
            entry.query = normalize_query(column(&row, "query_stats", "query")?, self.redact_sql);
            entry.database = column(&row, "query_stats", "datname")?;
            entry.calls = column(&row, "query_stats", "calls")?;
            entry.execution_time_ms = column(&row, "query_stats", "mean_exec_time")?;
            entry.total_exec_time_ms = column(&row, "query_stats", "total_exec_time")?;
            entry.stddev_exec_time_ms = column(&row, "query_stats", "stddev_exec_time")?;
            entry.planning_time_ms = column(&row, "query_stats", "mean_plan_time")?;
            entry.rows_returned = column(&row, "query_stats", "rows")?;
            entry.shared_blocks_hit = column(&row, "query_stats", "shared_blks_hit")?;
            entry.shared_blocks_read = column(&row, "query_stats", "shared_blks_read")?;
            entry.temp_blocks_read = column(&row, "query_stats", "temp_blks_read")?;
            entry.temp_blocks_written = column(&row, "query_stats", "temp_blks_written")?;
            entry.collected_at = collected_at;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn table_stats(&self, limit: u32) -> Result<Vec<TableMetrics>> {
        let rows = self
            .bounded(
                "table_stats",
                sqlx::query(TABLE_STATS_SQL)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool),
            )
            .await?;

        let collected_at = Utc::now();
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let q = "table_stats";
            let last_vacuum: Option<DateTime<Utc>> = column(&row, q, "last_vacuum")?;
            let last_autovacuum: Option<DateTime<Utc>> = column(&row, q, "last_autovacuum")?;
            let last_analyze: Option<DateTime<Utc>> = column(&row, q, "last_analyze")?;
            entries.push(TableMetrics {
                cluster_id: self.cluster_id.clone(),
                database: column(&row, q, "database")?,
                schema: column(&row, q, "schemaname")?,
                table: column(&row, q, "relname")?,
                seq_scan: column(&row, q, "seq_scan")?,
                seq_tup_read: column(&row, q, "seq_tup_read")?,
                idx_scan: column(&row, q, "idx_scan")?,
                idx_tup_fetch: column(&row, q, "idx_tup_fetch")?,
                tup_inserted: column(&row, q, "n_tup_ins")?,
                tup_updated: column(&row, q, "n_tup_upd")?,
                tup_deleted: column(&row, q, "n_tup_del")?,
                tup_hot_updated: column(&row, q, "n_tup_hot_upd")?,
                live_tuples: column(&row, q, "n_live_tup")?,
                dead_tuples: column(&row, q, "n_dead_tup")?,
                vacuum_count: column(&row, q, "vacuum_count")?,
                autovacuum_count: column(&row, q, "autovacuum_count")?,
                analyze_count: column(&row, q, "analyze_count")?,
                last_vacuum,
                last_autovacuum,
                last_analyze,
                collected_at,
            });
        }
        Ok(entries)
    }
}
