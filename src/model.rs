use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Canonical metric names written by the collector and referenced by
/// thresholds, baselines, and recommendation rules.
pub mod metric {
    pub const ACTIVE_CONNECTIONS: &str = "active_connections";
    pub const IDLE_CONNECTIONS: &str = "idle_connections";
    pub const MAX_CONNECTIONS: &str = "max_connections";
    pub const CONNECTION_UTILIZATION: &str = "connection_utilization";
    pub const CACHE_HIT_RATIO: &str = "cache_hit_ratio";
    pub const BUFFER_CACHE_HIT_RATIO: &str = "buffer_cache_hit_ratio";
    pub const AVG_QUERY_TIME_MS: &str = "avg_query_time_ms";
    pub const SLOW_QUERIES_COUNT: &str = "slow_queries_count";
    pub const LOCKS_COUNT: &str = "locks_count";
    pub const WAITING_LOCKS: &str = "waiting_locks";
    pub const DEADLOCKS_COUNT: &str = "deadlocks_count";
    pub const DATABASE_SIZE_BYTES: &str = "database_size_bytes";
    pub const DISK_READS: &str = "disk_reads";
    pub const TEMP_BYTES: &str = "temp_bytes";
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const DISK_USAGE: &str = "disk_usage";

    /// Gauge-like metrics that get a learned baseline. Cumulative counters
    /// (deadlocks, block reads, database size) are excluded; z-scores over
    /// monotonic series flag every sample eventually.
    pub const BASELINED: &[&str] = &[
        ACTIVE_CONNECTIONS,
        IDLE_CONNECTIONS,
        CONNECTION_UTILIZATION,
        CACHE_HIT_RATIO,
        BUFFER_CACHE_HIT_RATIO,
        AVG_QUERY_TIME_MS,
        SLOW_QUERIES_COUNT,
        LOCKS_COUNT,
        WAITING_LOCKS,
        CPU_USAGE,
        MEMORY_USAGE,
        DISK_USAGE,
    ];

    /// Coarse grouping stored alongside each sample so consumers can
    /// filter series by family without listing names.
    pub fn type_of(name: &str) -> &'static str {
        match name {
            ACTIVE_CONNECTIONS | IDLE_CONNECTIONS | MAX_CONNECTIONS | CONNECTION_UTILIZATION => {
                "connections"
            }
            CACHE_HIT_RATIO | BUFFER_CACHE_HIT_RATIO => "cache",
            AVG_QUERY_TIME_MS | SLOW_QUERIES_COUNT => "statements",
            LOCKS_COUNT | WAITING_LOCKS | DEADLOCKS_COUNT => "locks",
            DATABASE_SIZE_BYTES | DISK_READS | TEMP_BYTES => "storage",
            CPU_USAGE | MEMORY_USAGE | DISK_USAGE => "system",
            _ => "other",
        }
    }
}

/// Alert severity, ordered so that `max()` picks the more urgent candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn is_escalated(self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// Alert classification. Threshold breaches and baseline deviations stay
/// distinct types; they merge only when the full key coincides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AlertType {
    Performance,
    Anomaly,
    Connection,
    Other(String),
}

impl AlertType {
    pub fn as_str(&self) -> &str {
        match self {
            AlertType::Performance => "performance",
            AlertType::Anomaly => "anomaly",
            AlertType::Connection => "connection",
            AlertType::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "performance" => AlertType::Performance,
            "anomaly" => AlertType::Anomaly,
            "connection" => AlertType::Connection,
            other => AlertType::Other(other.to_string()),
        }
    }
}

impl Serialize for AlertType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AlertType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AlertType::parse(&raw))
    }
}

/// Recommendation priority. Narrower than alert severity on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "high" => Priority::High,
            "medium" => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecommendationCategory {
    Configuration,
    QueryOptimization,
    CapacityPlanning,
    Maintenance,
    Other(String),
}

impl RecommendationCategory {
    pub fn as_str(&self) -> &str {
        match self {
            RecommendationCategory::Configuration => "configuration",
            RecommendationCategory::QueryOptimization => "query_optimization",
            RecommendationCategory::CapacityPlanning => "capacity_planning",
            RecommendationCategory::Maintenance => "maintenance",
            RecommendationCategory::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "configuration" => RecommendationCategory::Configuration,
            "query_optimization" => RecommendationCategory::QueryOptimization,
            "capacity_planning" => RecommendationCategory::CapacityPlanning,
            "maintenance" => RecommendationCategory::Maintenance,
            other => RecommendationCategory::Other(other.to_string()),
        }
    }
}

impl Serialize for RecommendationCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecommendationCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(RecommendationCategory::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "connected" => ConnectionStatus::Connected,
            "error" => ConnectionStatus::Error,
            _ => ConnectionStatus::Pending,
        }
    }
}

/// A monitored PostgreSQL instance as configured by the external CRUD layer.
/// The core reads these rows and only writes back connection status fields.
/// `credential_ref` names a secret held by the credential provider; the
/// password itself never appears in this struct or in the store.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoredTarget {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub credential_ref: String,
    pub is_active: bool,
    pub alert_thresholds: HashMap<String, f64>,
    #[serde(with = "humantime_serde")]
    pub monitoring_interval: Duration,
    pub adaptive_interval: bool,
    pub connection_status: ConnectionStatus,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// One metric reading inside a collection batch.
#[derive(Debug, Clone, Serialize)]
pub struct MetricReading {
    pub name: String,
    pub metric_type: &'static str,
    pub value: f64,
    pub unit: String,
    pub metadata: Option<serde_json::Value>,
}

/// All samples gathered from one target in one cycle. Every reading shares
/// `collected_at` and the batch persists atomically.
#[derive(Debug, Clone, Serialize)]
pub struct MetricBatch {
    pub target_id: i64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub collected_at: DateTime<Utc>,
    pub readings: Vec<MetricReading>,
}

impl MetricBatch {
    pub fn new(target_id: i64, collected_at: DateTime<Utc>) -> Self {
        Self {
            target_id,
            collected_at,
            readings: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &str, value: f64, unit: &str) {
        self.readings.push(MetricReading {
            name: name.to_string(),
            metric_type: metric::type_of(name),
            value,
            unit: unit.to_string(),
            metadata: None,
        });
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings
            .iter()
            .find(|reading| reading.name == name)
            .map(|reading| reading.value)
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }
}

/// One point in a per-metric time series.
#[derive(Debug, Clone, Serialize)]
pub struct SamplePoint {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Per-statement aggregate captured from the target's pg_stat_statements,
/// consumed by the recommendation engine.
#[derive(Debug, Clone, Serialize)]
pub struct QueryStat {
    pub target_id: i64,
    pub query_id: i64,
    pub calls: i64,
    pub mean_time_ms: f64,
    pub total_time_ms: f64,
    pub rows: i64,
    pub performance_category: &'static str,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub collected_at: DateTime<Utc>,
}

impl QueryStat {
    /// Bucket a statement by its mean execution time.
    pub fn categorize(mean_time_ms: f64) -> &'static str {
        if mean_time_ms > 1_000.0 {
            "critical"
        } else if mean_time_ms > 500.0 {
            "slow"
        } else if mean_time_ms > 100.0 {
            "normal"
        } else {
            "fast"
        }
    }
}

/// Where an alert candidate came from. Merged candidates keep every tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Threshold,
    Anomaly,
    Scheduler,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Threshold => "threshold",
            Provenance::Anomaly => "anomaly",
            Provenance::Scheduler => "scheduler",
        }
    }
}

/// Identity of a logical alert across its open/acknowledge/resolve life.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub target_id: i64,
    pub alert_type: AlertType,
    pub key: String,
}

/// A proposed alert emitted by an evaluator, not yet merged into the alert
/// manager's state.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub target_id: i64,
    pub alert_type: AlertType,
    pub key: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub metric_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub provenance: Provenance,
    pub detail: Option<serde_json::Value>,
}

impl AlertCandidate {
    pub fn alert_key(&self) -> AlertKey {
        AlertKey {
            target_id: self.target_id,
            alert_type: self.alert_type.clone(),
            key: self.key.clone(),
        }
    }
}

/// Every candidate for one alert key within a cycle, merged: highest
/// severity wins, provenance tags accumulate.
#[derive(Debug, Clone)]
pub struct MergedCandidate {
    pub key: AlertKey,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub metric_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub provenance: Vec<Provenance>,
    pub detail: serde_json::Value,
}

/// A persisted alert row.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub target_id: i64,
    pub alert_type: AlertType,
    pub alert_key: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub is_active: bool,
    pub is_acknowledged: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub metric_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub metadata: serde_json::Value,
}

/// A rule fire not yet written to the store. Re-fires of the same
/// (target, category, rule) refresh the open row instead of duplicating it.
#[derive(Debug, Clone)]
pub struct RecommendationDraft {
    pub target_id: i64,
    pub category: RecommendationCategory,
    pub rule: String,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub suggested_action: String,
    pub impact_estimate: Option<String>,
    pub metadata: serde_json::Value,
}

/// A persisted recommendation row. `is_applied` flips exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub id: i64,
    pub target_id: i64,
    pub category: RecommendationCategory,
    pub rule: String,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub suggested_action: String,
    pub impact_estimate: Option<String>,
    pub is_applied: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub applied_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(
            Severity::Medium.max(Severity::High),
            Severity::High,
            "merge must keep the higher severity"
        );
    }

    #[test]
    fn alert_type_round_trips_unknown_values() {
        assert_eq!(AlertType::parse("performance"), AlertType::Performance);
        let custom = AlertType::parse("replication");
        assert_eq!(custom.as_str(), "replication");
        assert!(matches!(custom, AlertType::Other(_)));
    }

    #[test]
    fn query_stat_categories_follow_mean_time() {
        assert_eq!(QueryStat::categorize(1_500.0), "critical");
        assert_eq!(QueryStat::categorize(750.0), "slow");
        assert_eq!(QueryStat::categorize(250.0), "normal");
        assert_eq!(QueryStat::categorize(10.0), "fast");
    }

    #[test]
    fn batch_lookup_finds_present_metrics_only() {
        let mut batch = MetricBatch::new(7, Utc::now());
        batch.push(metric::CPU_USAGE, 42.5, "percent");
        assert_eq!(batch.get(metric::CPU_USAGE), Some(42.5));
        assert_eq!(batch.get(metric::MEMORY_USAGE), None);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.readings[0].metric_type, "system");
    }

    #[test]
    fn metric_families_cover_the_collected_set() {
        assert_eq!(metric::type_of(metric::ACTIVE_CONNECTIONS), "connections");
        assert_eq!(metric::type_of(metric::CACHE_HIT_RATIO), "cache");
        assert_eq!(metric::type_of(metric::DEADLOCKS_COUNT), "locks");
        assert_eq!(metric::type_of(metric::DATABASE_SIZE_BYTES), "storage");
        assert_eq!(metric::type_of("replication_lag"), "other");
    }
}
