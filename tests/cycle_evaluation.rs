//! The pure evaluation path of one monitoring cycle: threshold breaches
//! and baseline deviations produced from the same batch, then merged
//! per alert key.

use std::collections::HashMap;

use chrono::Utc;
use pgfleet::alerts::merge_candidates;
use pgfleet::anomaly::AnomalyDetector;
use pgfleet::config::{AnomalyConfig, EvaluatorConfig};
use pgfleet::evaluate;
use pgfleet::model::{MetricBatch, Severity, metric};

fn small_detector() -> AnomalyDetector {
    AnomalyDetector::new(AnomalyConfig {
        window: 100,
        min_train: 20,
        ..AnomalyConfig::default()
    })
}

// Alternates around the mean so the variance is small but non-zero.
fn training_series(mean: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| if i % 2 == 0 { mean - 1.0 } else { mean + 1.0 })
        .collect()
}

#[tokio::test]
async fn threshold_and_baseline_flag_the_same_spike_separately() {
    let policy = EvaluatorConfig::default();
    let detector = small_detector();
    let now = Utc::now();
    detector
        .train(7, metric::ACTIVE_CONNECTIONS, &training_series(50.0, 60), now)
        .await;

    let mut batch = MetricBatch::new(7, now);
    batch.push(metric::ACTIVE_CONNECTIONS, 90.0, "connections");
    let mut thresholds = HashMap::new();
    thresholds.insert(metric::ACTIVE_CONNECTIONS.to_string(), 80.0);

    let mut candidates = evaluate::evaluate(&batch, &thresholds, &policy);
    assert_eq!(candidates.len(), 1, "threshold breach expected");

    let anomaly = detector
        .score(7, metric::ACTIVE_CONNECTIONS, 90.0, "connections", &policy, now)
        .await
        .expect("z-score far beyond the cutoff");
    candidates.push(anomaly);

    // Performance and anomaly alerts share a metric but not a key, so
    // the merge keeps them apart.
    let merged = merge_candidates(candidates);
    assert_eq!(merged.len(), 2);

    let performance = merged
        .iter()
        .find(|m| m.key.alert_type.as_str() == "performance")
        .expect("threshold alert present");
    // 90 over an 80 threshold is a 1.125 ratio, below the high cutoff.
    assert_eq!(performance.severity, Severity::Medium);
    assert_eq!(performance.key.key, metric::ACTIVE_CONNECTIONS);

    let anomaly = merged
        .iter()
        .find(|m| m.key.alert_type.as_str() == "anomaly")
        .expect("baseline alert present");
    // Forty standard deviations out is critical in any policy.
    assert_eq!(anomaly.severity, Severity::Critical);
    assert_eq!(anomaly.key.key, metric::ACTIVE_CONNECTIONS);
}

#[tokio::test]
async fn calm_cycle_produces_no_candidates() {
    let policy = EvaluatorConfig::default();
    let detector = small_detector();
    let now = Utc::now();
    detector
        .train(7, metric::ACTIVE_CONNECTIONS, &training_series(50.0, 60), now)
        .await;

    let mut batch = MetricBatch::new(7, now);
    batch.push(metric::ACTIVE_CONNECTIONS, 51.0, "connections");
    let mut thresholds = HashMap::new();
    thresholds.insert(metric::ACTIVE_CONNECTIONS.to_string(), 80.0);

    let candidates = evaluate::evaluate(&batch, &thresholds, &policy);
    assert!(candidates.is_empty());

    let scored = detector
        .score(7, metric::ACTIVE_CONNECTIONS, 51.0, "connections", &policy, now)
        .await;
    assert!(scored.is_none(), "one sigma off the mean is not anomalous");
}

#[tokio::test]
async fn threshold_still_fires_without_a_baseline() {
    let policy = EvaluatorConfig::default();
    let detector = small_detector();
    let now = Utc::now();

    let mut batch = MetricBatch::new(9, now);
    batch.push(metric::CPU_USAGE, 95.0, "percent");
    let mut thresholds = HashMap::new();
    thresholds.insert(metric::CPU_USAGE.to_string(), 80.0);

    let candidates = evaluate::evaluate(&batch, &thresholds, &policy);
    assert_eq!(candidates.len(), 1);

    let scored = detector
        .score(9, metric::CPU_USAGE, 95.0, "percent", &policy, now)
        .await;
    assert!(scored.is_none(), "untrained detector must abstain");
}
