use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::model::MetricsSnapshot;

/// Health of one background loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopHealth {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LoopHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Default)]
struct SharedStateInner {
    snapshots: RwLock<HashMap<String, MetricsSnapshot>>,
    loop_health: RwLock<HashMap<String, LoopHealth>>,
}

/// Latest snapshot per cluster plus loop health, shared by the loops and HTTP.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedStateInner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store_snapshot(&self, snapshot: MetricsSnapshot) {
        self.inner
            .snapshots
            .write()
            .await
            .insert(snapshot.cluster_id.clone(), snapshot);
    }

    pub async fn latest_snapshot(&self, cluster_id: &str) -> Option<MetricsSnapshot> {
        self.inner.snapshots.read().await.get(cluster_id).cloned()
    }

    /// Drop cached snapshots for clusters that are no longer registered and
    /// return their ids.
    pub async fn retain_clusters(&self, cluster_ids: &[String]) -> Vec<String> {
        let mut snapshots = self.inner.snapshots.write().await;
        let mut dropped: Vec<String> = snapshots
            .keys()
            .filter(|id| !cluster_ids.contains(id))
            .cloned()
            .collect();
        for id in &dropped {
            snapshots.remove(id);
        }
        dropped.sort();
        dropped
    }

    pub async fn record_loop_success(&self, loop_name: &str) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.last_success_at = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    pub async fn record_loop_failure(&self, loop_name: &str, error: String) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error);
    }

    pub async fn loop_health(&self) -> Vec<LoopHealth> {
        let mut loops: Vec<LoopHealth> = self
            .inner
            .loop_health
            .read()
            .await
            .values()
            .cloned()
            .collect();
        loops.sort_by(|a, b| a.name.cmp(&b.name));
        loops
    }

    /// Every named loop has succeeded within `max_staleness` and is not failing.
    pub async fn is_ready(&self, loop_names: &[&str], max_staleness: Duration) -> bool {
        let health = self.inner.loop_health.read().await;
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(max_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop_names.iter().all(|name| match health.get(*name) {
            Some(entry) if entry.consecutive_failures == 0 => entry
                .last_success_at
                .is_some_and(|last| now.signed_duration_since(last) <= staleness),
            _ => false,
        })
    }
}
