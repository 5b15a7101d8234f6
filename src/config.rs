use std::{
    collections::{BTreeMap, HashSet},
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};
use serde::Deserialize;
use sqlx::postgres::PgSslMode;
use tracing::{info, warn};

use crate::error::MonitorError;

const DEFAULT_CONFIG_PATH: &str = "/config/pgfleet.yaml";

static ENV_REFERENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}|\$([A-Z_][A-Z0-9_]*)").ok());

pub const DEFAULT_MAX_CONNECTIONS: u32 = 25;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(30 * 60);

/// Top-level configuration for the fleet monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterEndpoint>,
    #[serde(default)]
    pub sample_intervals: SampleIntervals,
    #[serde(default)]
    pub thresholds: PerformanceThresholds,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            sample_intervals: SampleIntervals::default(),
            thresholds: PerformanceThresholds::default(),
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            security: SecurityConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Connection parameters for one monitored cluster.
#[derive(Clone, Deserialize)]
pub struct ClusterEndpoint {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "ClusterEndpoint::default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "ClusterEndpoint::default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub conn_max_lifetime: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub conn_max_idle_time: Option<Duration>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ClusterEndpoint {
    const fn default_port() -> u16 {
        5432
    }

    fn default_ssl_mode() -> String {
        "prefer".to_string()
    }

    /// Minimal endpoint with every optional field unset.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            host: host.into(),
            port,
            user: user.into(),
            password: String::new(),
            database: database.into(),
            ssl_mode: Self::default_ssl_mode(),
            max_connections: None,
            min_connections: None,
            conn_max_lifetime: None,
            conn_max_idle_time: None,
            region: None,
            environment: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn parsed_ssl_mode(&self) -> Result<PgSslMode, MonitorError> {
        PgSslMode::from_str(&self.ssl_mode).map_err(|_| {
            MonitorError::Validation(format!(
                "cluster {}: unknown ssl_mode {:?}",
                self.id, self.ssl_mode
            ))
        })
    }

    /// Reject endpoints that can never produce a usable pool.
    pub fn validate(&self) -> Result<(), MonitorError> {
        let invalid = |msg: String| Err(MonitorError::Validation(msg));
        if self.id.trim().is_empty() {
            return invalid("cluster id is required".into());
        }
        if self.host.trim().is_empty() {
            return invalid(format!("cluster {}: host is required", self.id));
        }
        if self.port == 0 {
            return invalid(format!("cluster {}: invalid port 0", self.id));
        }
        if self.user.trim().is_empty() {
            return invalid(format!("cluster {}: user is required", self.id));
        }
        if self.database.trim().is_empty() {
            return invalid(format!("cluster {}: database is required", self.id));
        }
        if self.max_connections == Some(0) {
            return invalid(format!("cluster {}: max_connections must be > 0", self.id));
        }
        self.parsed_ssl_mode()?;
        Ok(())
    }

    /// Pool bounds with unset values replaced by the fleet defaults.
    pub fn pool_settings(&self) -> PoolSettings {
        let max_connections = self
            .max_connections
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let min_connections = self
            .min_connections
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MIN_CONNECTIONS)
            .min(max_connections);

        PoolSettings {
            max_connections,
            min_connections,
            max_lifetime: self
                .conn_max_lifetime
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_CONN_MAX_LIFETIME),
            idle_timeout: self
                .conn_max_idle_time
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_CONN_MAX_IDLE_TIME),
        }
    }
}

impl fmt::Debug for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEndpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .finish_non_exhaustive()
    }
}

/// Resolved pool sizing and connection lifetime bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

/// Loop schedule configuration (with friendly duration parsing).
#[derive(Debug, Clone, Deserialize)]
pub struct SampleIntervals {
    /// Metrics battery (connections, cache, locks, replication, bloat, I/O).
    #[serde(default = "SampleIntervals::default_metrics", with = "humantime_serde")]
    pub metrics: Duration,
    /// Topology refresh; defaults to twice the metrics interval.
    #[serde(default, with = "humantime_serde")]
    pub cluster_info: Option<Duration>,
}

impl SampleIntervals {
    const fn default_metrics() -> Duration {
        Duration::from_secs(60)
    }

    pub fn cluster_info(&self) -> Duration {
        self.cluster_info.unwrap_or(self.metrics * 2)
    }
}

impl Default for SampleIntervals {
    fn default() -> Self {
        Self {
            metrics: Self::default_metrics(),
            cluster_info: None,
        }
    }
}

/// Alerting thresholds in percent / milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PerformanceThresholds {
    #[serde(default = "PerformanceThresholds::default_max_connections_percent")]
    pub max_connections_percent: f64,
    #[serde(default = "PerformanceThresholds::default_min_cache_hit_ratio")]
    pub min_cache_hit_ratio: f64,
    #[serde(default = "PerformanceThresholds::default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    #[serde(default = "PerformanceThresholds::default_max_memory_percent")]
    pub max_memory_percent: f64,
    #[serde(default = "PerformanceThresholds::default_max_replication_lag_ms")]
    pub max_replication_lag_ms: i64,
    #[serde(default = "PerformanceThresholds::default_max_slow_query_ms")]
    pub max_slow_query_ms: f64,
    #[serde(default = "PerformanceThresholds::default_max_table_bloat_percent")]
    pub max_table_bloat_percent: f64,
}

impl PerformanceThresholds {
    const fn default_max_connections_percent() -> f64 {
        80.0
    }

    const fn default_min_cache_hit_ratio() -> f64 {
        95.0
    }

    const fn default_max_cpu_percent() -> f64 {
        80.0
    }

    const fn default_max_memory_percent() -> f64 {
        85.0
    }

    const fn default_max_replication_lag_ms() -> i64 {
        10_000
    }

    const fn default_max_slow_query_ms() -> f64 {
        1_000.0
    }

    const fn default_max_table_bloat_percent() -> f64 {
        20.0
    }
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_connections_percent: Self::default_max_connections_percent(),
            min_cache_hit_ratio: Self::default_min_cache_hit_ratio(),
            max_cpu_percent: Self::default_max_cpu_percent(),
            max_memory_percent: Self::default_max_memory_percent(),
            max_replication_lag_ms: Self::default_max_replication_lag_ms(),
            max_slow_query_ms: Self::default_max_slow_query_ms(),
            max_table_bloat_percent: Self::default_max_table_bloat_percent(),
        }
    }
}

/// Limits that keep on-demand result sets bounded.
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "Limits::default_top_queries")]
    pub top_queries: u32,
    #[serde(default = "Limits::default_top_tables")]
    pub top_tables: u32,
}

impl Limits {
    const fn default_top_queries() -> u32 {
        100
    }

    const fn default_top_tables() -> u32 {
        100
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            top_queries: Self::default_top_queries(),
            top_tables: Self::default_top_tables(),
        }
    }
}

/// Client-side bounds on every network call, plus Postgres session timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_probe", with = "humantime_serde")]
    pub probe: Duration,
    #[serde(default = "Timeouts::default_health_check", with = "humantime_serde")]
    pub health_check: Duration,
    #[serde(default = "Timeouts::default_query", with = "humantime_serde")]
    pub query: Duration,
    #[serde(default = "Timeouts::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "Timeouts::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Timeouts {
    const fn default_probe() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_health_check() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_query() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_statement_timeout_ms() -> u64 {
        3_000
    }

    const fn default_lock_timeout_ms() -> u64 {
        1_000
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Self::default_probe(),
            health_check: Self::default_health_check(),
            query: Self::default_query(),
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Security guardrails enforced by the monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub read_only_enforce: bool,
    #[serde(default = "default_true")]
    pub redact_sql_text: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            read_only_enforce: true,
            redact_sql_text: true,
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8080".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

/// Load configuration from a YAML file, then apply env overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("PGFLEET_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    apply_env_overrides(&mut config)?;
    validate(&config)?;
    info!(clusters = config.clusters.len(), "configuration validated");
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = parse_yaml(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

/// Parse YAML after expanding `${VAR}` / `$VAR` references from the environment.
pub fn parse_yaml(raw: &str) -> Result<AppConfig> {
    let expanded = expand_env_vars(raw, |name| env::var(name).ok());
    Ok(serde_yaml::from_str(&expanded)?)
}

/// Unknown or empty variables are left verbatim so validation can point at them.
pub fn expand_env_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let Some(pattern) = ENV_REFERENCE.as_ref() else {
        return input.to_string();
    };
    pattern
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match lookup(name) {
                Some(value) if !value.is_empty() => value,
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(bind) = env::var("PGFLEET_BIND") {
        if !bind.is_empty() {
            config.http.bind = bind;
        }
    }

    if let Ok(interval) = env::var("PGFLEET_METRICS_INTERVAL") {
        config.sample_intervals.metrics = humantime_serde::re::humantime::parse_duration(&interval)
            .with_context(|| format!("invalid PGFLEET_METRICS_INTERVAL {interval:?}"))?;
    }

    // Single-cluster bootstrap for container deployments.
    if let Ok(host) = env::var("PGFLEET_DATABASE_HOST") {
        if !host.trim().is_empty() {
            let port = match env::var("PGFLEET_DATABASE_PORT") {
                Ok(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid PGFLEET_DATABASE_PORT {raw:?}"))?,
                Err(_) => 5432,
            };
            let mut endpoint = ClusterEndpoint::new(
                env_or("PGFLEET_DATABASE_ID", "default"),
                host,
                port,
                env_or("PGFLEET_DATABASE_USER", "postgres"),
                env_or("PGFLEET_DATABASE_NAME", "postgres"),
            );
            endpoint.password = env_or("PGFLEET_DATABASE_PASSWORD", "");
            endpoint.ssl_mode = env_or("PGFLEET_DATABASE_SSLMODE", "prefer");
            config.clusters.push(endpoint);
        }
    }

    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Fleet-level validation on top of per-endpoint checks.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.clusters.is_empty() {
        bail!(
            "at least one cluster must be configured (YAML `clusters:` or PGFLEET_DATABASE_HOST)"
        );
    }

    let mut seen = HashSet::new();
    for endpoint in &config.clusters {
        endpoint.validate()?;
        if !seen.insert(endpoint.id.as_str()) {
            bail!("duplicate cluster id {:?} in configuration", endpoint.id);
        }
    }

    if config.sample_intervals.metrics.is_zero() {
        bail!("sample_intervals.metrics must be greater than zero");
    }
    if config.sample_intervals.cluster_info().is_zero() {
        bail!("sample_intervals.cluster_info must be greater than zero");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
clusters:
  - id: primary
    name: Primary
    host: db1.internal
    user: monitor
    password: ${PGFLEET_TEST_PRIMARY_PASSWORD}
    database: app
    ssl_mode: require
    max_connections: 10
    conn_max_lifetime: 15m
    region: eu-west-1
    tags:
      tier: gold
  - id: replica
    host: db2.internal
    port: 6432
    user: monitor
    database: app
sample_intervals:
  metrics: 30s
thresholds:
  max_connections_percent: 70
"#;

    #[test]
    fn pool_settings_apply_defaults_when_unset() {
        let endpoint = ClusterEndpoint::new("a", "localhost", 5432, "u", "db");
        let settings = endpoint.pool_settings();
        assert_eq!(settings.max_connections, 25);
        assert_eq!(settings.min_connections, 5);
        assert_eq!(settings.max_lifetime, Duration::from_secs(3600));
        assert_eq!(settings.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn pool_settings_keep_explicit_values_and_clamp_min() {
        let mut endpoint = ClusterEndpoint::new("a", "localhost", 5432, "u", "db");
        endpoint.max_connections = Some(3);
        endpoint.conn_max_idle_time = Some(Duration::from_secs(60));
        let settings = endpoint.pool_settings();
        assert_eq!(settings.max_connections, 3);
        assert_eq!(settings.min_connections, 3);
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_lifetime, DEFAULT_CONN_MAX_LIFETIME);
    }

    #[test]
    fn validate_rejects_missing_fields_and_bad_ssl_mode() {
        let mut endpoint = ClusterEndpoint::new("a", "", 5432, "u", "db");
        assert!(matches!(
            endpoint.validate(),
            Err(MonitorError::Validation(_))
        ));

        endpoint.host = "localhost".into();
        endpoint.ssl_mode = "sometimes".into();
        assert!(matches!(
            endpoint.validate(),
            Err(MonitorError::Validation(_))
        ));

        endpoint.ssl_mode = "verify-full".into();
        assert!(endpoint.validate().is_ok());
    }

    #[test]
    fn expand_env_vars_replaces_known_and_keeps_unknown() {
        let lookup = |name: &str| match name {
            "SECRET" => Some("hunter2".to_string()),
            "HOST" => Some("db".to_string()),
            _ => None,
        };
        let out = expand_env_vars("pw=${SECRET} host=$HOST other=${MISSING}", lookup);
        assert_eq!(out, "pw=hunter2 host=db other=${MISSING}");
    }

    #[test]
    fn parse_yaml_reads_clusters_and_intervals() {
        let cfg = parse_yaml(SAMPLE).expect("parse");
        assert_eq!(cfg.clusters.len(), 2);

        let primary = &cfg.clusters[0];
        assert_eq!(primary.display_name(), "Primary");
        assert_eq!(primary.port, 5432);
        assert_eq!(primary.conn_max_lifetime, Some(Duration::from_secs(900)));
        assert_eq!(primary.tags.get("tier").map(String::as_str), Some("gold"));

        let replica = &cfg.clusters[1];
        assert_eq!(replica.display_name(), "replica");
        assert_eq!(replica.port, 6432);
        assert_eq!(replica.ssl_mode, "prefer");

        assert_eq!(cfg.sample_intervals.metrics, Duration::from_secs(30));
        assert_eq!(cfg.sample_intervals.cluster_info(), Duration::from_secs(60));
        assert_eq!(cfg.thresholds.max_connections_percent, 70.0);
        assert_eq!(cfg.thresholds.min_cache_hit_ratio, 95.0);
        assert_eq!(cfg.limits.top_queries, 100);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_ids_and_empty_fleet() {
        assert!(validate(&AppConfig::default()).is_err());

        let mut cfg = AppConfig::default();
        cfg.clusters
            .push(ClusterEndpoint::new("a", "h1", 5432, "u", "db"));
        cfg.clusters
            .push(ClusterEndpoint::new("a", "h2", 5432, "u", "db"));
        let err = validate(&cfg).expect_err("duplicate ids");
        assert!(err.to_string().contains("duplicate cluster id"));
    }

    #[test]
    fn validate_rejects_zero_sample_intervals() {
        let zero_info = SAMPLE.replace("  metrics: 30s", "  metrics: 30s\n  cluster_info: 0s");
        let cfg = parse_yaml(&zero_info).expect("parse");
        assert_eq!(cfg.sample_intervals.cluster_info(), Duration::ZERO);
        let err = validate(&cfg).expect_err("zero cluster_info interval");
        assert!(err.to_string().contains("sample_intervals.cluster_info"));

        let zero_metrics = SAMPLE.replace("  metrics: 30s", "  metrics: 0s");
        let cfg = parse_yaml(&zero_metrics).expect("parse");
        let err = validate(&cfg).expect_err("zero metrics interval");
        assert!(err.to_string().contains("sample_intervals.metrics"));
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut endpoint = ClusterEndpoint::new("a", "localhost", 5432, "u", "db");
        endpoint.password = "s3cret".into();
        let rendered = format!("{endpoint:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("***"));
    }
}
