use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterEndpoint, PoolSettings, Timeouts};
use crate::error::{MonitorError, Result, describe_sqlx_error};

const APPLICATION_NAME: &str = "pgfleet";

/// Pool utilization snapshot for one registered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub in_use: u32,
    pub idle: u32,
    pub total: u32,
    pub max: u32,
    pub min: u32,
}

struct RegisteredPool {
    pool: PgPool,
    settings: PoolSettings,
    endpoint: Arc<ClusterEndpoint>,
}

/// Owns one read-only connection pool per cluster id.
///
/// Lookups share the map; add/remove/close take it exclusively. Connecting and
/// probing happen before the write lock is taken and pools are closed after it
/// is released.
#[derive(Clone)]
pub struct ConnectionRegistry {
    pools: Arc<RwLock<HashMap<String, RegisteredPool>>>,
    timeouts: Timeouts,
    read_only: bool,
}

impl ConnectionRegistry {
    pub fn new(timeouts: Timeouts, read_only: bool) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            timeouts,
            read_only,
        }
    }

    /// Validate, connect and probe `endpoint`, then publish its pool.
    pub async fn add_cluster(&self, endpoint: ClusterEndpoint) -> Result<()> {
        endpoint.validate()?;

        if self.pools.read().await.contains_key(&endpoint.id) {
            return Err(MonitorError::AlreadyExists(endpoint.id));
        }

        let settings = endpoint.pool_settings();
        let pool = self.build_pool(&endpoint, settings)?;

        if let Err(err) = self.probe(&endpoint.id, &pool, self.timeouts.probe).await {
            pool.close().await;
            return Err(err);
        }

        let id = endpoint.id.clone();
        {
            let mut pools = self.pools.write().await;
            if !pools.contains_key(&id) {
                pools.insert(
                    id.clone(),
                    RegisteredPool {
                        pool,
                        settings,
                        endpoint: Arc::new(endpoint),
                    },
                );
                info!(
                    cluster = %id,
                    max_connections = settings.max_connections,
                    min_connections = settings.min_connections,
                    "registered cluster"
                );
                return Ok(());
            }
        }

        // Another caller registered the same id while we were probing.
        pool.close().await;
        Err(MonitorError::AlreadyExists(id))
    }

    pub async fn get_pool(&self, id: &str) -> Result<PgPool> {
        self.pools
            .read()
            .await
            .get(id)
            .map(|entry| entry.pool.clone())
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))
    }

    pub async fn endpoint(&self, id: &str) -> Result<Arc<ClusterEndpoint>> {
        self.pools
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.endpoint))
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))
    }

    /// Re-probe connectivity without touching registry state.
    pub async fn health_check(&self, id: &str) -> Result<()> {
        let pool = self.get_pool(id).await?;
        self.probe(id, &pool, self.timeouts.health_check).await
    }

    pub async fn remove_cluster(&self, id: &str) -> Result<()> {
        let removed = self.pools.write().await.remove(id);
        match removed {
            Some(entry) => {
                entry.pool.close().await;
                info!(cluster = %id, "removed cluster");
                Ok(())
            }
            None => Err(MonitorError::NotFound(id.to_string())),
        }
    }

    pub async fn list_cluster_ids(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self, id: &str) -> Result<PoolStats> {
        let pools = self.pools.read().await;
        let entry = pools
            .get(id)
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))?;
        let total = entry.pool.size();
        let idle = u32::try_from(entry.pool.num_idle()).unwrap_or(u32::MAX).min(total);
        Ok(PoolStats {
            in_use: total - idle,
            idle,
            total,
            max: entry.settings.max_connections,
            min: entry.settings.min_connections,
        })
    }

    /// Release every pool. Later lookups report `NotFound`.
    pub async fn close(&self) {
        let drained: Vec<(String, RegisteredPool)> = self.pools.write().await.drain().collect();
        for (id, entry) in drained {
            entry.pool.close().await;
            debug!(cluster = %id, "closed pool");
        }
        info!("connection registry closed");
    }

    fn build_pool(&self, endpoint: &ClusterEndpoint, settings: PoolSettings) -> Result<PgPool> {
        let mut options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .database(&endpoint.database)
            .ssl_mode(endpoint.parsed_ssl_mode()?)
            .application_name(APPLICATION_NAME)
            .options([
                (
                    "statement_timeout",
                    self.timeouts.statement_timeout_ms.to_string(),
                ),
                ("lock_timeout", self.timeouts.lock_timeout_ms.to_string()),
            ]);
        if !endpoint.password.is_empty() {
            options = options.password(&endpoint.password);
        }

        let read_only = self.read_only;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .max_lifetime(settings.max_lifetime)
            .idle_timeout(settings.idle_timeout)
            .acquire_timeout(self.timeouts.probe)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if read_only {
                        sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                            .execute(&mut *conn)
                            .await
                            .map_err(|err| {
                                error!(error = ?err, "failed to enforce read-only session");
                                err
                            })?;
                        sqlx::query("SET default_transaction_read_only = on")
                            .execute(&mut *conn)
                            .await
                            .map_err(|err| {
                                error!(error = ?err, "failed to enforce read-only default");
                                err
                            })?;
                    }
                    Ok(())
                })
            })
            .connect_lazy_with(options);

        Ok(pool)
    }

    /// `SELECT 1` (or the read-only check) under a hard deadline.
    async fn probe(&self, id: &str, pool: &PgPool, limit: Duration) -> Result<()> {
        let sql = if self.read_only {
            "SELECT current_setting('default_transaction_read_only') = 'on'"
        } else {
            "SELECT true"
        };

        let outcome = tokio::time::timeout(limit, sqlx::query_scalar::<_, bool>(sql).fetch_one(pool))
            .await;
        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                warn!(cluster = %id, "session is not read-only");
                Err(MonitorError::connection(
                    id,
                    "monitor session is not read-only; refusing to use it",
                ))
            }
            Ok(Err(err)) => {
                warn!(cluster = %id, error = %describe_sqlx_error(&err), "connectivity probe failed");
                Err(MonitorError::connection(id, describe_sqlx_error(&err)))
            }
            Err(_) => {
                warn!(cluster = %id, timeout = ?limit, "connectivity probe timed out");
                Err(MonitorError::connection(
                    id,
                    format!("probe timed out after {limit:?}"),
                ))
            }
        }
    }

    /// Register a lazily-connecting pool without probing it.
    #[cfg(test)]
    pub(crate) async fn insert_unprobed(&self, endpoint: ClusterEndpoint) -> Result<()> {
        let settings = endpoint.pool_settings();
        let pool = self.build_pool(&endpoint, settings)?;
        self.pools.write().await.insert(
            endpoint.id.clone(),
            RegisteredPool {
                pool,
                settings,
                endpoint: Arc::new(endpoint),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            probe: Duration::from_millis(500),
            health_check: Duration::from_millis(500),
            ..Timeouts::default()
        }
    }

    fn unreachable(id: &str) -> ClusterEndpoint {
        // Port 1 on loopback refuses connections immediately.
        ClusterEndpoint::new(id, "127.0.0.1", 1, "monitor", "postgres")
    }

    #[tokio::test]
    async fn add_cluster_with_unreachable_host_fails_without_registering() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        let err = registry
            .add_cluster(unreachable("down"))
            .await
            .expect_err("probe must fail");
        assert!(matches!(err, MonitorError::Connection { ref cluster, .. } if cluster == "down"));
        assert!(registry.list_cluster_ids().await.is_empty());
        assert!(matches!(
            registry.get_pool("down").await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_cluster_rejects_invalid_endpoint_before_connecting() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        let mut endpoint = unreachable("bad");
        endpoint.user.clear();
        let err = registry.add_cluster(endpoint).await.expect_err("invalid");
        assert!(matches!(err, MonitorError::Validation(_)));
    }

    #[tokio::test]
    async fn add_cluster_twice_reports_already_exists_and_keeps_original() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        registry
            .insert_unprobed(unreachable("a"))
            .await
            .expect("insert");

        let err = registry
            .add_cluster(unreachable("a"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, MonitorError::AlreadyExists(ref id) if id == "a"));

        let pool = registry.get_pool("a").await.expect("original pool kept");
        assert!(!pool.is_closed());
        assert_eq!(registry.list_cluster_ids().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn remove_cluster_then_lookup_is_not_found() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        registry
            .insert_unprobed(unreachable("a"))
            .await
            .expect("insert");

        let pool = registry.get_pool("a").await.expect("pool");
        registry.remove_cluster("a").await.expect("remove");
        assert!(pool.is_closed());
        assert!(matches!(
            registry.get_pool("a").await,
            Err(MonitorError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove_cluster("a").await,
            Err(MonitorError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove_cluster("never-added").await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_report_configured_bounds_for_lazy_pool() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        let mut endpoint = unreachable("a");
        endpoint.max_connections = Some(7);
        registry.insert_unprobed(endpoint).await.expect("insert");

        let stats = registry.stats("a").await.expect("stats");
        assert_eq!(stats.max, 7);
        assert_eq!(stats.min, 5);
        assert_eq!(stats.in_use + stats.idle, stats.total);
        assert!(matches!(
            registry.stats("missing").await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_check_fails_for_unreachable_and_unknown_clusters() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        registry
            .insert_unprobed(unreachable("a"))
            .await
            .expect("insert");

        assert!(matches!(
            registry.health_check("a").await,
            Err(MonitorError::Connection { .. })
        ));
        assert!(matches!(
            registry.health_check("nope").await,
            Err(MonitorError::NotFound(_))
        ));
        // Health checks never unregister.
        assert!(registry.get_pool("a").await.is_ok());
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let registry = ConnectionRegistry::new(fast_timeouts(), true);
        registry
            .insert_unprobed(unreachable("a"))
            .await
            .expect("insert");
        registry
            .insert_unprobed(unreachable("b"))
            .await
            .expect("insert");

        registry.close().await;
        assert!(registry.list_cluster_ids().await.is_empty());
        assert!(matches!(
            registry.endpoint("a").await,
            Err(MonitorError::NotFound(_))
        ));
    }
}
