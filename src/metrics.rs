use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Metrics registry for the agent scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    pipeline: PipelineMetrics,
    alerts: AlertMetrics,
    anomaly: AnomalyMetrics,
    recommendations: RecommendationMetrics,
    retention: RetentionMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("pgfleet".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let pipeline = PipelineMetrics::register(&registry)?;
        let alerts = AlertMetrics::register(&registry)?;
        let anomaly = AnomalyMetrics::register(&registry)?;
        let recommendations = RecommendationMetrics::register(&registry)?;
        let retention = RetentionMetrics::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            pipeline,
            alerts,
            anomaly,
            recommendations,
            retention,
        })
    }

    /// Observe the execution duration for a loop iteration.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for a loop iteration (1=success, 0=failed).
    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(if success { 1 } else { 0 });
    }

    /// Increment the error counter for a loop.
    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    pub fn inc_cycle(&self, fleet: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.pipeline
            .cycles_total
            .with_label_values(&[fleet, outcome])
            .inc();
    }

    pub fn observe_cycle_duration(&self, fleet: &str, duration: Duration) {
        self.pipeline
            .cycle_duration
            .with_label_values(&[fleet])
            .observe(duration.as_secs_f64());
    }

    pub fn add_samples_written(&self, fleet: &str, count: u64) {
        self.pipeline
            .samples_written
            .with_label_values(&[fleet])
            .inc_by(count);
    }

    pub fn inc_store_retry(&self, fleet: &str) {
        self.pipeline
            .store_retries
            .with_label_values(&[fleet])
            .inc();
    }

    pub fn set_active_targets(&self, fleet: &str, count: i64) {
        self.pipeline
            .active_targets
            .with_label_values(&[fleet])
            .set(count);
    }

    pub fn inc_alert_opened(&self, fleet: &str, alert_type: &str, severity: &str) {
        self.alerts
            .opened_total
            .with_label_values(&[fleet, alert_type, severity])
            .inc();
    }

    pub fn add_auto_resolved(&self, fleet: &str, count: u64) {
        self.alerts
            .auto_resolved_total
            .with_label_values(&[fleet])
            .inc_by(count);
    }

    /// Replace the active-alert gauge with the latest store counts.
    /// Severities absent from the slice drop out of the exposition.
    pub fn set_active_alerts(&self, fleet: &str, by_severity: &[(String, i64)]) {
        self.alerts.active.reset();
        for (severity, count) in by_severity {
            let severity = sanitize_label(severity);
            self.alerts
                .active
                .with_label_values(&[fleet, severity.as_str()])
                .set(*count);
        }
    }

    pub fn set_baseline_models(&self, fleet: &str, count: i64) {
        self.anomaly
            .cached_models
            .with_label_values(&[fleet])
            .set(count);
    }

    pub fn inc_training(&self, fleet: &str, outcome: &str) {
        self.anomaly
            .trainings_total
            .with_label_values(&[fleet, outcome])
            .inc();
    }

    pub fn inc_anomaly(&self, fleet: &str, severity: &str) {
        self.anomaly
            .flagged_total
            .with_label_values(&[fleet, severity])
            .inc();
    }

    pub fn inc_recommendation(&self, fleet: &str, category: &str, priority: &str) {
        let category = sanitize_label(category);
        self.recommendations
            .emitted_total
            .with_label_values(&[fleet, category.as_str(), priority])
            .inc();
    }

    pub fn add_purged(&self, fleet: &str, entity: &str, count: u64) {
        self.retention
            .purged_rows_total
            .with_label_values(&[fleet, entity])
            .inc_by(count);
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "loop_last_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("loop_errors_total", "Total loop errors"),
            &["loop"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct PipelineMetrics {
    cycles_total: IntCounterVec,
    cycle_duration: HistogramVec,
    samples_written: IntCounterVec,
    store_retries: IntCounterVec,
    active_targets: IntGaugeVec,
}

impl PipelineMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let cycles_total = IntCounterVec::new(
            Opts::new(
                "target_cycles_total",
                "Collection cycles grouped by outcome",
            ),
            &["fleet", "outcome"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let cycle_duration = HistogramVec::new(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Per-target collection cycle duration",
            ),
            &["fleet"],
        )?;
        registry.register(Box::new(cycle_duration.clone()))?;

        let samples_written = IntCounterVec::new(
            Opts::new(
                "samples_written_total",
                "Metric samples persisted to the store",
            ),
            &["fleet"],
        )?;
        registry.register(Box::new(samples_written.clone()))?;

        let store_retries = IntCounterVec::new(
            Opts::new(
                "store_retries_total",
                "Retried store writes after transient failures",
            ),
            &["fleet"],
        )?;
        registry.register(Box::new(store_retries.clone()))?;

        let active_targets = IntGaugeVec::new(
            Opts::new("active_targets", "Targets currently scheduled"),
            &["fleet"],
        )?;
        registry.register(Box::new(active_targets.clone()))?;

        Ok(Self {
            cycles_total,
            cycle_duration,
            samples_written,
            store_retries,
            active_targets,
        })
    }
}

#[derive(Clone)]
struct AlertMetrics {
    opened_total: IntCounterVec,
    auto_resolved_total: IntCounterVec,
    active: IntGaugeVec,
}

impl AlertMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let opened_total = IntCounterVec::new(
            Opts::new(
                "alerts_opened_total",
                "Opened alerts grouped by type and severity",
            ),
            &["fleet", "type", "severity"],
        )?;
        registry.register(Box::new(opened_total.clone()))?;

        let auto_resolved_total = IntCounterVec::new(
            Opts::new(
                "alerts_auto_resolved_total",
                "Alerts resolved automatically after their key went quiet",
            ),
            &["fleet"],
        )?;
        registry.register(Box::new(auto_resolved_total.clone()))?;

        let active = IntGaugeVec::new(
            Opts::new("active_alerts", "Currently active alerts by severity"),
            &["fleet", "severity"],
        )?;
        registry.register(Box::new(active.clone()))?;

        Ok(Self {
            opened_total,
            auto_resolved_total,
            active,
        })
    }
}

#[derive(Clone)]
struct AnomalyMetrics {
    cached_models: IntGaugeVec,
    trainings_total: IntCounterVec,
    flagged_total: IntCounterVec,
}

impl AnomalyMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let cached_models = IntGaugeVec::new(
            Opts::new("baseline_models", "Baseline models currently cached"),
            &["fleet"],
        )?;
        registry.register(Box::new(cached_models.clone()))?;

        let trainings_total = IntCounterVec::new(
            Opts::new(
                "model_trainings_total",
                "Baseline training runs grouped by outcome",
            ),
            &["fleet", "outcome"],
        )?;
        registry.register(Box::new(trainings_total.clone()))?;

        let flagged_total = IntCounterVec::new(
            Opts::new(
                "anomalies_flagged_total",
                "Anomaly candidates emitted grouped by severity",
            ),
            &["fleet", "severity"],
        )?;
        registry.register(Box::new(flagged_total.clone()))?;

        Ok(Self {
            cached_models,
            trainings_total,
            flagged_total,
        })
    }
}

#[derive(Clone)]
struct RecommendationMetrics {
    emitted_total: IntCounterVec,
}

impl RecommendationMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let emitted_total = IntCounterVec::new(
            Opts::new(
                "recommendations_emitted_total",
                "Recommendation rule fires grouped by category and priority",
            ),
            &["fleet", "category", "priority"],
        )?;
        registry.register(Box::new(emitted_total.clone()))?;

        Ok(Self { emitted_total })
    }
}

#[derive(Clone)]
struct RetentionMetrics {
    purged_rows_total: IntCounterVec,
}

impl RetentionMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let purged_rows_total = IntCounterVec::new(
            Opts::new(
                "retention_purged_rows_total",
                "Rows removed by retention sweeps grouped by entity",
            ),
            &["fleet", "entity"],
        )?;
        registry.register(Box::new(purged_rows_total.clone()))?;

        Ok(Self { purged_rows_total })
    }
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == ':' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_counters_label_outcomes() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.inc_cycle("local", true);
        metrics.inc_cycle("local", true);
        metrics.inc_cycle("local", false);

        let output = metrics.encode().expect("encode");
        assert!(
            output.contains(
                "pgfleet_target_cycles_total{fleet=\"local\",outcome=\"success\"} 2"
            ),
            "success count missing: {output}"
        );
        assert!(
            output.contains(
                "pgfleet_target_cycles_total{fleet=\"local\",outcome=\"failure\"} 1"
            ),
            "failure count missing: {output}"
        );
    }

    #[test]
    fn active_alert_gauge_resets_between_updates() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.set_active_alerts("local", &[("critical".to_string(), 2)]);
        metrics.set_active_alerts("local", &[("medium".to_string(), 1)]);

        let output = metrics.encode().expect("encode");
        assert!(
            output.contains("pgfleet_active_alerts{fleet=\"local\",severity=\"medium\"} 1"),
            "medium gauge missing: {output}"
        );
        assert!(
            !output.contains("severity=\"critical\""),
            "stale severity still exposed: {output}"
        );
    }

    #[test]
    fn alert_and_anomaly_counters_record_labels() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.inc_alert_opened("local", "performance", "high");
        metrics.inc_anomaly("local", "critical");
        metrics.inc_recommendation("local", "query_optimization", "high");

        let output = metrics.encode().expect("encode");
        assert!(output.contains(
            "pgfleet_alerts_opened_total{fleet=\"local\",severity=\"high\",type=\"performance\"} 1"
        ));
        assert!(output
            .contains("pgfleet_anomalies_flagged_total{fleet=\"local\",severity=\"critical\"} 1"));
        assert!(output.contains(
            "pgfleet_recommendations_emitted_total{category=\"query_optimization\",fleet=\"local\",priority=\"high\"} 1"
        ));
    }

    #[test]
    fn purge_counters_accumulate_per_entity() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.add_purged("local", "samples", 120);
        metrics.add_purged("local", "samples", 30);
        metrics.add_purged("local", "alerts", 4);

        let output = metrics.encode().expect("encode");
        assert!(output.contains(
            "pgfleet_retention_purged_rows_total{entity=\"samples\",fleet=\"local\"} 150"
        ));
        assert!(output.contains(
            "pgfleet_retention_purged_rows_total{entity=\"alerts\",fleet=\"local\"} 4"
        ));
    }
}
