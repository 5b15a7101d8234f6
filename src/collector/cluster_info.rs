use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::collector::snapshot::isolate;
use crate::collector::source::{PgStatsSource, StatsSource};
use crate::config::{AppConfig, ClusterEndpoint};
use crate::error::{MonitorError, Result};
use crate::model::{ClusterConfiguration, ClusterInfo, ClusterStatus, ReplicationSummary, SettingValue};
use crate::registry::ConnectionRegistry;

/// Fields gathered by one refresh; `None` marks a failed sub-collection.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigurationUpdate {
    pub version: Option<String>,
    pub settings: Option<BTreeMap<String, SettingValue>>,
    pub databases: Option<Vec<String>>,
    pub replication: Option<ReplicationSummary>,
    pub extensions: Option<Vec<String>>,
}

impl ConfigurationUpdate {
    /// Overwrite only the fields collected this time.
    pub fn apply_to(self, configuration: &mut ClusterConfiguration) {
        if let Some(version) = self.version {
            configuration.version = Some(version);
        }
        if let Some(settings) = self.settings {
            configuration.settings = Some(settings);
        }
        if let Some(databases) = self.databases {
            configuration.databases = Some(databases);
        }
        if let Some(replication) = self.replication {
            configuration.replication = Some(replication);
        }
        if let Some(extensions) = self.extensions {
            configuration.extensions = Some(extensions);
        }
    }
}

/// Refresh version, settings, databases, replication and extensions independently.
pub async fn collect_configuration(cluster_id: &str, source: &dyn StatsSource) -> ConfigurationUpdate {
    ConfigurationUpdate {
        version: isolate(cluster_id, "version", source.version().await),
        settings: isolate(cluster_id, "settings", source.settings().await),
        databases: isolate(cluster_id, "databases", source.databases().await),
        replication: isolate(cluster_id, "replication", source.replication_status().await),
        extensions: isolate(cluster_id, "extensions", source.extensions().await),
    }
}

/// Initial entry for an endpoint, carrying its labels in the configuration bag.
pub fn seed_info(endpoint: &ClusterEndpoint) -> ClusterInfo {
    let mut info = ClusterInfo::new(&endpoint.id, endpoint.display_name());
    let extra = &mut info.configuration.extra;
    extra.insert("host".into(), Value::from(endpoint.host.as_str()));
    extra.insert("port".into(), Value::from(endpoint.port));
    extra.insert("database".into(), Value::from(endpoint.database.as_str()));
    if let Some(region) = &endpoint.region {
        extra.insert("region".into(), Value::from(region.as_str()));
    }
    if let Some(environment) = &endpoint.environment {
        extra.insert("environment".into(), Value::from(environment.as_str()));
    }
    if !endpoint.tags.is_empty() {
        let tags = endpoint
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        extra.insert("tags".into(), Value::Object(tags));
    }
    info
}

/// Keeps the last known topology of every cluster.
///
/// The map is read by API callers while the refresh loop writes it; queries
/// run before the write lock is taken.
#[derive(Clone)]
pub struct ClusterInfoCollector {
    registry: ConnectionRegistry,
    clusters: Arc<RwLock<HashMap<String, ClusterInfo>>>,
    query_timeout: Duration,
    redact_sql: bool,
}

impl ClusterInfoCollector {
    pub fn new(registry: ConnectionRegistry, config: &AppConfig) -> Self {
        Self {
            registry,
            clusters: Arc::new(RwLock::new(HashMap::new())),
            query_timeout: config.timeouts.query,
            redact_sql: config.security.redact_sql_text,
        }
    }

    /// Seed or replace an entry outside the refresh loop.
    pub async fn register_cluster(&self, info: ClusterInfo) {
        let id = info.id.clone();
        self.clusters.write().await.insert(id.clone(), info);
        info!(cluster = %id, "registered cluster info");
    }

    pub async fn unregister_cluster(&self, id: &str) -> Result<()> {
        match self.clusters.write().await.remove(id) {
            Some(_) => {
                info!(cluster = %id, "unregistered cluster info");
                Ok(())
            }
            None => Err(MonitorError::NotFound(id.to_string())),
        }
    }

    pub async fn get_cluster(&self, id: &str) -> Result<ClusterInfo> {
        self.clusters
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))
    }

    /// All entries ordered by id.
    pub async fn list_clusters(&self) -> Vec<ClusterInfo> {
        let mut clusters: Vec<ClusterInfo> = self.clusters.read().await.values().cloned().collect();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        clusters
    }

    /// Health-check one cluster and, when reachable, refresh its configuration.
    pub async fn refresh_cluster(&self, id: &str) -> Result<ClusterStatus> {
        let endpoint = self.registry.endpoint(id).await?;

        match self.registry.health_check(id).await {
            Ok(()) => {}
            Err(MonitorError::NotFound(missing)) => return Err(MonitorError::NotFound(missing)),
            Err(err) => {
                warn!(cluster = %id, error = %err, "cluster is unhealthy");
                self.mark_unhealthy(&endpoint).await;
                return Ok(ClusterStatus::Unhealthy);
            }
        }

        let pool = self.registry.get_pool(id).await?;
        let source = PgStatsSource::new(id, pool, self.query_timeout, self.redact_sql);
        let update = collect_configuration(id, &source).await;
        self.mark_healthy(&endpoint, update).await;
        debug!(cluster = %id, "collected cluster info");
        Ok(ClusterStatus::Healthy)
    }

    /// Flag the cluster unhealthy, keeping previously collected fields.
    pub async fn mark_unhealthy(&self, endpoint: &ClusterEndpoint) {
        let mut clusters = self.clusters.write().await;
        let info = clusters
            .entry(endpoint.id.clone())
            .or_insert_with(|| seed_info(endpoint));
        info.status = ClusterStatus::Unhealthy;
        info.updated_at = Utc::now();
    }

    /// Flag the cluster healthy and merge the fields collected this tick.
    pub async fn mark_healthy(&self, endpoint: &ClusterEndpoint, update: ConfigurationUpdate) {
        let mut clusters = self.clusters.write().await;
        let info = clusters
            .entry(endpoint.id.clone())
            .or_insert_with(|| seed_info(endpoint));
        info.status = ClusterStatus::Healthy;
        update.apply_to(&mut info.configuration);
        info.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_info_carries_labels() {
        let mut endpoint = ClusterEndpoint::new("eu-1", "db.internal", 5432, "monitor", "app");
        endpoint.name = Some("EU primary".into());
        endpoint.region = Some("eu-west-1".into());
        endpoint.tags.insert("tier".into(), "gold".into());

        let info = seed_info(&endpoint);
        assert_eq!(info.name, "EU primary");
        assert_eq!(info.status, ClusterStatus::Unknown);
        assert_eq!(info.configuration.extra["region"], "eu-west-1");
        assert_eq!(info.configuration.extra["tags"]["tier"], "gold");
        assert_eq!(info.configuration.extra["port"], 5432);
    }

    #[test]
    fn partial_update_keeps_previous_fields() {
        let mut configuration = ClusterConfiguration {
            version: Some("PostgreSQL 15.3".into()),
            extensions: Some(vec!["pgcrypto".into()]),
            ..ClusterConfiguration::default()
        };

        ConfigurationUpdate {
            version: Some("PostgreSQL 16.1".into()),
            databases: Some(vec!["app".into()]),
            ..ConfigurationUpdate::default()
        }
        .apply_to(&mut configuration);

        assert_eq!(configuration.version.as_deref(), Some("PostgreSQL 16.1"));
        assert_eq!(configuration.databases, Some(vec!["app".to_string()]));
        assert_eq!(configuration.extensions, Some(vec!["pgcrypto".to_string()]));
        assert!(configuration.settings.is_none());
    }
}
