use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Connection,
    Performance,
    Capacity,
    Replication,
    Query,
    Availability,
    Security,
    Configuration,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertCategory::Connection => "connection",
            AlertCategory::Performance => "performance",
            AlertCategory::Capacity => "capacity",
            AlertCategory::Replication => "replication",
            AlertCategory::Query => "query",
            AlertCategory::Availability => "availability",
            AlertCategory::Security => "security",
            AlertCategory::Configuration => "configuration",
        }
    }
}

/// Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

/// A threshold breach derived from one snapshot or statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub cluster_id: String,
    pub title: String,
    pub message: String,
    pub metric: String,
    pub threshold: f64,
    pub current_value: f64,
    #[serde(rename = "timestamp")]
    pub raised_at: DateTime<Utc>,
    pub status: AlertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub actions: Vec<String>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }

    pub fn acknowledge(&mut self, by: impl Into<String>) {
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(by.into());
    }

    pub fn resolve(&mut self) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub last_checked: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            value: None,
            last_checked: Utc::now(),
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Degraded,
    Critical,
    Unknown,
}

/// Aggregate health of one cluster; `score` and `status` follow `checks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub cluster_id: String,
    pub status: HealthState,
    pub score: u8,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    pub last_check: DateTime<Utc>,
    pub checks: Vec<HealthCheck>,
}

impl HealthStatus {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            status: HealthState::Unknown,
            score: 0,
            active_alerts: 0,
            critical_alerts: 0,
            last_check: Utc::now(),
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, check: HealthCheck) {
        self.checks.push(check);
        self.recompute();
    }

    fn recompute(&mut self) {
        let (score, status) = score_checks(&self.checks);
        self.score = score;
        self.status = status;
    }
}

/// `floor(100 * ok / total)` and its bucket; no checks means unknown.
pub fn score_checks(checks: &[HealthCheck]) -> (u8, HealthState) {
    if checks.is_empty() {
        return (0, HealthState::Unknown);
    }

    let passed = checks
        .iter()
        .filter(|check| check.status != CheckStatus::Warning)
        .count();
    let score = (passed * 100 / checks.len()) as u8;

    let status = match score {
        90.. => HealthState::Healthy,
        70..=89 => HealthState::Warning,
        50..=69 => HealthState::Degraded,
        _ => HealthState::Critical,
    };
    (score, status)
}
