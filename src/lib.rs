pub mod alert;
pub mod analyzer;
pub mod app;
pub mod collector;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod state;

pub use alert::{Alert, AlertCategory, AlertSeverity, AlertStatus, HealthState, HealthStatus};
pub use analyzer::PerformanceAnalyzer;
pub use collector::{ClusterInfoCollector, MetricsCollector};
pub use error::MonitorError;
pub use model::{ClusterInfo, ClusterStatus, MetricsSnapshot, QueryMetrics, TableMetrics};
pub use registry::{ConnectionRegistry, PoolStats};
pub use state::SharedState;
