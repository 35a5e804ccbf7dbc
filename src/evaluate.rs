//! Pure threshold evaluation: a batch plus a target's configured
//! thresholds yields zero or more alert candidates. No I/O, no clock,
//! deterministic for a given input.

use std::collections::HashMap;

use crate::config::EvaluatorConfig;
use crate::model::{AlertCandidate, AlertType, MetricBatch, Provenance, Severity, metric};

/// Metrics where lower is worse; everything else alerts above threshold.
pub fn is_inverted(name: &str) -> bool {
    matches!(
        name,
        metric::CACHE_HIT_RATIO | metric::BUFFER_CACHE_HIT_RATIO
    )
}

/// Compare every reading that has a configured threshold. Readings
/// without a threshold, and thresholds without a reading, are skipped.
/// Candidates come back in batch order.
pub fn evaluate(
    batch: &MetricBatch,
    thresholds: &HashMap<String, f64>,
    policy: &EvaluatorConfig,
) -> Vec<AlertCandidate> {
    batch
        .readings
        .iter()
        .filter_map(|reading| {
            thresholds.get(&reading.name).and_then(|&threshold| {
                evaluate_metric(
                    batch.target_id,
                    &reading.name,
                    reading.value,
                    &reading.unit,
                    threshold,
                    policy,
                )
            })
        })
        .collect()
}

fn evaluate_metric(
    target_id: i64,
    name: &str,
    value: f64,
    unit: &str,
    threshold: f64,
    policy: &EvaluatorConfig,
) -> Option<AlertCandidate> {
    let inverted = is_inverted(name);
    let breached = if inverted {
        value < threshold
    } else {
        value > threshold
    };
    if !breached {
        return None;
    }

    let severity = breach_severity(value, threshold, inverted, policy);
    let (title, description) = if inverted {
        (
            format!("{name} below threshold"),
            format!("{name} is {value:.2} {unit}, below the configured minimum {threshold:.2}"),
        )
    } else {
        (
            format!("{name} above threshold"),
            format!("{name} is {value:.2} {unit}, above the configured threshold {threshold:.2}"),
        )
    };

    Some(AlertCandidate {
        target_id,
        alert_type: AlertType::Performance,
        key: name.to_string(),
        severity,
        title,
        description,
        metric_value: Some(value),
        threshold_value: Some(threshold),
        provenance: Provenance::Threshold,
        detail: None,
    })
}

/// Severity scales with how far past the threshold the value sits. For
/// inverted metrics the ratio flips; a non-positive value there means
/// the resource is fully degraded.
fn breach_severity(value: f64, threshold: f64, inverted: bool, policy: &EvaluatorConfig) -> Severity {
    let ratio = if inverted {
        if value <= 0.0 {
            return Severity::Critical;
        }
        threshold / value
    } else if threshold <= 0.0 {
        return Severity::Critical;
    } else {
        value / threshold
    };

    if ratio >= policy.critical_ratio {
        Severity::Critical
    } else if ratio >= policy.high_ratio {
        Severity::High
    } else {
        Severity::Medium
    }
}
