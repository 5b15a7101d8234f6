use chrono::{TimeZone, Utc};
use pgfleet::alert::{CheckStatus, HealthCheck, HealthState, score_checks};
use pgfleet::config::PerformanceThresholds;
use pgfleet::{AlertCategory, AlertSeverity, MetricsSnapshot, PerformanceAnalyzer, QueryMetrics};

fn quiet_snapshot(cluster: &str) -> MetricsSnapshot {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let mut snapshot = MetricsSnapshot::at(cluster, at);
    snapshot.connections_active = 10;
    snapshot.connections_total = 100;
    snapshot.cache_hit_ratio = 99.0;
    snapshot
}

#[test]
fn connection_usage_at_ninety_percent_is_high() {
    let mut snapshot = quiet_snapshot("eu-1");
    snapshot.connections_active = 90;

    let alerts = PerformanceAnalyzer::default().analyze_metrics(&snapshot);
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.category, AlertCategory::Connection);
    assert_eq!(alert.severity, AlertSeverity::High);
    assert_eq!(alert.id, "eu-1:connections_active");
    assert_eq!(alert.threshold, 80.0);
    assert!((alert.current_value - 90.0).abs() < f64::EPSILON);
    assert!(alert.message.contains("90.0%"));
}

#[test]
fn threshold_itself_does_not_alert() {
    let mut snapshot = quiet_snapshot("eu-1");
    snapshot.connections_active = 80;
    snapshot.cache_hit_ratio = 95.0;
    snapshot.cpu_usage = 80.0;
    snapshot.memory_usage = 85.0;
    snapshot.replication_lag_ms = 10_000;
    snapshot.lock_waits = 100;
    snapshot.table_bloat_pct = 20.0;

    assert!(PerformanceAnalyzer::default().analyze_metrics(&snapshot).is_empty());
}

#[test]
fn low_cache_ratio_tiers_downwards() {
    let analyzer = PerformanceAnalyzer::default();
    let severity_for = |ratio: f64| {
        let mut snapshot = quiet_snapshot("eu-1");
        snapshot.cache_hit_ratio = ratio;
        let alerts = analyzer.analyze_metrics(&snapshot);
        assert_eq!(alerts.len(), 1, "ratio {ratio}");
        assert_eq!(alerts[0].metric, "cache_hit_ratio");
        alerts[0].severity
    };

    assert_eq!(severity_for(94.0), AlertSeverity::Medium);
    assert_eq!(severity_for(88.0), AlertSeverity::High);
    assert_eq!(severity_for(82.0), AlertSeverity::Critical);
}

#[test]
fn deadlocks_and_lock_waits_are_reported_separately() {
    let mut snapshot = quiet_snapshot("eu-1");
    snapshot.lock_waits = 150;
    snapshot.deadlock_count = 3;

    let alerts = PerformanceAnalyzer::default().analyze_metrics(&snapshot);
    let metrics: Vec<&str> = alerts.iter().map(|a| a.metric.as_str()).collect();
    assert_eq!(metrics, vec!["lock_waits", "deadlock_count"]);
    assert_eq!(alerts[0].severity, AlertSeverity::Medium);
    assert_eq!(alerts[1].severity, AlertSeverity::High);
}

#[test]
fn analysis_is_repeatable() {
    let mut snapshot = quiet_snapshot("us-2");
    snapshot.cpu_usage = 97.0;
    snapshot.memory_usage = 91.0;
    snapshot.replication_lag_ms = 45_000;
    snapshot.table_bloat_pct = 33.0;

    let analyzer = PerformanceAnalyzer::default();
    let first = analyzer.analyze_metrics(&snapshot);
    let second = analyzer.analyze_metrics(&snapshot);
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|a| a.raised_at == snapshot.collected_at));
}

#[test]
fn custom_thresholds_apply() {
    let thresholds = PerformanceThresholds {
        max_cpu_percent: 50.0,
        ..PerformanceThresholds::default()
    };
    let mut snapshot = quiet_snapshot("eu-1");
    snapshot.cpu_usage = 60.0;

    let alerts = PerformanceAnalyzer::new(thresholds).analyze_metrics(&snapshot);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].metric, "cpu_usage");
    assert_eq!(alerts[0].severity, AlertSeverity::Medium);
    assert_eq!(alerts[0].threshold, 50.0);
}

fn statement(mean_ms: f64) -> QueryMetrics {
    let mut query = QueryMetrics::new("42", "eu-1");
    query.execution_time_ms = mean_ms;
    query.calls = 10;
    query
}

#[test]
fn slow_query_severity_scales_with_threshold() {
    let analyzer = PerformanceAnalyzer::default();
    let severity_for = |mean: f64| {
        let alerts = analyzer.analyze_query_performance(&statement(mean));
        alerts.first().map(|alert| alert.severity)
    };

    assert_eq!(severity_for(1_000.0), None);
    assert_eq!(severity_for(1_500.0), Some(AlertSeverity::Medium));
    assert_eq!(severity_for(5_000.0), Some(AlertSeverity::Medium));
    assert_eq!(severity_for(5_001.0), Some(AlertSeverity::High));
    assert_eq!(severity_for(10_001.0), Some(AlertSeverity::Critical));
}

#[test]
fn temp_block_spill_raises_medium_alert() {
    let mut query = statement(10.0);
    query.temp_blocks_written = 20_000;

    let alerts = PerformanceAnalyzer::default().analyze_query_performance(&query);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, "eu-1:temp_blocks:42");
    assert_eq!(alerts[0].severity, AlertSeverity::Medium);
    assert_eq!(alerts[0].metadata["temp_blocks_written"], 20_000);
}

#[test]
fn health_score_is_share_of_passing_checks() {
    let checks: Vec<HealthCheck> = [
        CheckStatus::Ok,
        CheckStatus::Ok,
        CheckStatus::Warning,
        CheckStatus::Ok,
    ]
    .into_iter()
    .map(|status| HealthCheck::new("check", status, ""))
    .collect();

    assert_eq!(score_checks(&checks), (75, HealthState::Warning));
    assert_eq!(score_checks(&[]), (0, HealthState::Unknown));
}

#[test]
fn health_counts_only_active_alerts() {
    let mut snapshot = quiet_snapshot("eu-1");
    snapshot.connections_active = 99;
    snapshot.cache_hit_ratio = 50.0;

    let analyzer = PerformanceAnalyzer::default();
    let mut alerts = analyzer.analyze_metrics(&snapshot);
    assert_eq!(alerts.len(), 2);
    alerts[1].acknowledge("oncall");

    let health = analyzer.generate_health_status("eu-1", &snapshot, &alerts);
    assert_eq!(health.active_alerts, 1);
    assert_eq!(health.critical_alerts, 1);
    // Connection Pool and Cache Performance fail, five of seven pass.
    assert_eq!(health.checks.len(), 7);
    assert_eq!(health.score, 71);
    assert_eq!(health.status, HealthState::Warning);
}

#[test]
fn connection_check_skipped_without_limit() {
    let mut snapshot = quiet_snapshot("eu-1");
    snapshot.connections_total = 0;

    let health = PerformanceAnalyzer::default().generate_health_status("eu-1", &snapshot, &[]);
    assert_eq!(health.checks.len(), 6);
    assert!(health.checks.iter().all(|c| c.name != "Connection Pool"));
    assert_eq!(health.status, HealthState::Healthy);
}
