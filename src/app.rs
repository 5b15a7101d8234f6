use std::sync::Arc;

use crate::analyzer::PerformanceAnalyzer;
use crate::collector::{ClusterInfoCollector, MetricsCollector};
use crate::config::AppConfig;
use crate::metrics::AppMetrics;
use crate::registry::ConnectionRegistry;
use crate::state::SharedState;

/// Shared application context passed to HTTP handlers and collector loops.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: ConnectionRegistry,
    pub collector: MetricsCollector,
    pub cluster_info: ClusterInfoCollector,
    pub analyzer: PerformanceAnalyzer,
    pub metrics: AppMetrics,
    pub state: SharedState,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        registry: ConnectionRegistry,
        metrics: AppMetrics,
        state: SharedState,
    ) -> Self {
        let collector = MetricsCollector::new(registry.clone(), &config);
        let cluster_info = ClusterInfoCollector::new(registry.clone(), &config);
        let analyzer = PerformanceAnalyzer::new(config.thresholds.clone());
        Self {
            config: Arc::new(config),
            registry,
            collector,
            cluster_info,
            analyzer,
            metrics,
            state,
        }
    }
}
