//! Learned baselines: per-(target, metric) rolling statistics that flag
//! values the static thresholds would miss. Models live in an in-memory
//! cache with a TTL; an expired or missing model means the detector
//! abstains rather than guessing.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::{AnomalyConfig, EvaluatorConfig};
use crate::model::{AlertCandidate, AlertType, Provenance, Severity};

/// Fixed-capacity ring over the most recent observations, with running
/// sums for O(1) mean and variance.
#[derive(Debug, Clone)]
struct RollingStats {
    values: Vec<f64>,
    window_size: usize,
    head: usize,
    count: usize,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    fn new(window_size: usize) -> Self {
        Self {
            values: vec![0.0; window_size],
            window_size,
            head: 0,
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.count >= self.window_size {
            let old = self.values[self.head];
            self.sum -= old;
            self.sum_sq -= old * old;
        } else {
            self.count += 1;
        }

        self.values[self.head] = value;
        self.sum += value;
        self.sum_sq += value * value;
        self.head = (self.head + 1) % self.window_size;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = (self.sum_sq / n) - (self.mean() * self.mean());
        if variance <= 0.0 { 0.0 } else { variance.sqrt() }
    }

    fn z_score(&self, value: f64) -> f64 {
        let sd = self.std_dev();
        if sd < f64::EPSILON {
            return 0.0;
        }
        (value - self.mean()) / sd
    }
}

/// A trained profile of one metric's normal behavior on one target.
#[derive(Debug, Clone)]
struct BaselineModel {
    stats: RollingStats,
    trained_at: DateTime<Utc>,
    sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Trained { samples: usize },
    /// Below the minimum training size; the pair abstains until it has
    /// enough history.
    Insufficient { samples: usize },
}

/// Model cache keyed by (target_id, metric_name). Expiry is checked on
/// every access; the hourly trainer refreshes due entries.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    models: RwLock<HashMap<(i64, String), BaselineModel>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the baseline for one pair from a chronological value
    /// series. Too little history evicts any cached model so a stale
    /// profile cannot linger past its data.
    pub async fn train(
        &self,
        target_id: i64,
        metric: &str,
        values: &[f64],
        now: DateTime<Utc>,
    ) -> TrainOutcome {
        if values.len() < self.config.min_train {
            self.models
                .write()
                .await
                .remove(&(target_id, metric.to_string()));
            return TrainOutcome::Insufficient {
                samples: values.len(),
            };
        }

        let mut stats = RollingStats::new(self.config.window);
        for value in values {
            stats.push(*value);
        }
        let sample_count = stats.count;
        self.models.write().await.insert(
            (target_id, metric.to_string()),
            BaselineModel {
                stats,
                trained_at: now,
                sample_count,
            },
        );
        TrainOutcome::Trained {
            samples: sample_count,
        }
    }

    /// When the current model for the pair was trained, if one is cached.
    pub async fn trained_at(&self, target_id: i64, metric: &str) -> Option<DateTime<Utc>> {
        self.models
            .read()
            .await
            .get(&(target_id, metric.to_string()))
            .map(|model| model.trained_at)
    }

    /// Whether the pair needs (re)training: no model, TTL lapsed, or
    /// enough fresh samples accumulated since the last fit.
    pub async fn training_due(
        &self,
        target_id: i64,
        metric: &str,
        fresh_samples: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let models = self.models.read().await;
        match models.get(&(target_id, metric.to_string())) {
            None => true,
            Some(model) => {
                self.is_expired(model, now)
                    || fresh_samples as f64
                        > self.config.retrain_fraction * model.sample_count as f64
            }
        }
    }

    /// Score a fresh value against the cached baseline. Abstains with
    /// `None` when there is no valid model or the value sits inside the
    /// learned band.
    pub async fn score(
        &self,
        target_id: i64,
        metric: &str,
        value: f64,
        unit: &str,
        policy: &EvaluatorConfig,
        now: DateTime<Utc>,
    ) -> Option<AlertCandidate> {
        let models = self.models.read().await;
        let model = models.get(&(target_id, metric.to_string()))?;
        if self.is_expired(model, now) || model.sample_count < self.config.min_train {
            return None;
        }

        let z = model.stats.z_score(value);
        if z.abs() < self.config.z_cutoff {
            return None;
        }

        let mean = model.stats.mean();
        let sd = model.stats.std_dev();
        let severity = deviation_severity(z.abs(), self.config.z_cutoff, policy);

        Some(AlertCandidate {
            target_id,
            alert_type: AlertType::Anomaly,
            key: metric.to_string(),
            severity,
            title: format!("{metric} deviates from baseline"),
            description: format!(
                "{metric} is {value:.2} {unit}, {z:+.1}\u{3c3} from baseline mean {mean:.2} (\u{3c3}={sd:.2})"
            ),
            metric_value: Some(value),
            threshold_value: None,
            provenance: Provenance::Anomaly,
            detail: Some(json!({
                "z_score": z,
                "mean": mean,
                "std_dev": sd,
                "samples": model.sample_count,
            })),
        })
    }

    pub async fn cached_models(&self) -> usize {
        self.models.read().await.len()
    }

    /// Drop models for targets no longer in the active set.
    pub async fn prune(&self, active_targets: &HashSet<i64>) -> usize {
        let mut models = self.models.write().await;
        let before = models.len();
        models.retain(|(target_id, _), _| active_targets.contains(target_id));
        before - models.len()
    }

    fn is_expired(&self, model: &BaselineModel, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.config.model_ttl) {
            Ok(ttl) => now.signed_duration_since(model.trained_at) >= ttl,
            Err(_) => false,
        }
    }
}

/// Same escalation convention as threshold breaches, relative to the
/// configured cutoff instead of a per-metric threshold.
fn deviation_severity(z_abs: f64, cutoff: f64, policy: &EvaluatorConfig) -> Severity {
    if z_abs >= cutoff * policy.critical_ratio {
        Severity::Critical
    } else if z_abs >= cutoff * policy.high_ratio {
        Severity::High
    } else {
        Severity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn small_config() -> AnomalyConfig {
        AnomalyConfig {
            window: 100,
            min_train: 10,
            ..AnomalyConfig::default()
        }
    }

    #[test]
    fn rolling_stats_track_mean_and_spread() {
        let mut stats = RollingStats::new(5);
        for value in [10.0, 20.0, 30.0, 40.0, 50.0] {
            stats.push(value);
        }
        assert!((stats.mean() - 30.0).abs() < 0.01);
        assert!(stats.std_dev() > 0.0);

        // Overflow evicts the oldest value.
        stats.push(60.0);
        assert!((stats.mean() - 40.0).abs() < 0.01);
    }

    #[test]
    fn zero_variance_never_divides() {
        let mut stats = RollingStats::new(10);
        for _ in 0..10 {
            stats.push(42.0);
        }
        assert_eq!(stats.z_score(42.0), 0.0);
        assert_eq!(stats.z_score(9000.0), 0.0);
    }

    #[test]
    fn deviation_severity_buckets_by_multiplier() {
        let policy = EvaluatorConfig::default();
        assert_eq!(deviation_severity(3.1, 3.0, &policy), Severity::Medium);
        assert_eq!(deviation_severity(3.7, 3.0, &policy), Severity::High);
        assert_eq!(deviation_severity(4.6, 3.0, &policy), Severity::Critical);
    }

    #[tokio::test]
    async fn abstains_below_minimum_training_size() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let policy = EvaluatorConfig::default();
        let now = Utc::now();

        // 20 samples is under the 50-sample default floor.
        let history: Vec<f64> = (0..20).map(|i| 50.0 + (i % 3) as f64).collect();
        let outcome = detector.train(1, "cpu_usage", &history, now).await;
        assert_eq!(outcome, TrainOutcome::Insufficient { samples: 20 });

        let verdict = detector
            .score(1, "cpu_usage", 1_000_000.0, "percent", &policy, now)
            .await;
        assert!(verdict.is_none(), "must abstain even for an extreme value");
    }

    #[tokio::test]
    async fn trained_model_flags_outliers_only() {
        let detector = AnomalyDetector::new(small_config());
        let policy = EvaluatorConfig::default();
        let now = Utc::now();

        let history: Vec<f64> = (0..50).map(|i| 100.0 + (i % 5) as f64).collect();
        let outcome = detector.train(7, "locks_count", &history, now).await;
        assert!(matches!(outcome, TrainOutcome::Trained { samples: 50 }));

        let calm = detector
            .score(7, "locks_count", 102.0, "locks", &policy, now)
            .await;
        assert!(calm.is_none());

        let spike = detector
            .score(7, "locks_count", 500.0, "locks", &policy, now)
            .await
            .unwrap();
        assert_eq!(spike.alert_type, AlertType::Anomaly);
        assert_eq!(spike.severity, Severity::Critical);
        assert_eq!(spike.provenance, Provenance::Anomaly);
        assert_eq!(spike.metric_value, Some(500.0));
    }

    #[tokio::test]
    async fn expired_models_abstain_and_retrain() {
        let config = AnomalyConfig {
            model_ttl: StdDuration::from_secs(0),
            ..small_config()
        };
        let detector = AnomalyDetector::new(config);
        let policy = EvaluatorConfig::default();
        let now = Utc::now();

        let history: Vec<f64> = (0..50).map(|_| 10.0).collect();
        detector.train(3, "cpu_usage", &history, now).await;

        assert!(
            detector
                .score(3, "cpu_usage", 9_999.0, "percent", &policy, now)
                .await
                .is_none()
        );
        assert!(detector.training_due(3, "cpu_usage", 0, now).await);
    }

    #[tokio::test]
    async fn retrain_due_follows_fresh_sample_fraction() {
        let detector = AnomalyDetector::new(small_config());
        let now = Utc::now();

        let history: Vec<f64> = (0..100).map(|i| i as f64).collect();
        detector.train(5, "memory_usage", &history, now).await;

        // Default fraction is 0.8 of the 100-sample fit.
        assert!(!detector.training_due(5, "memory_usage", 80, now).await);
        assert!(detector.training_due(5, "memory_usage", 81, now).await);
        assert!(detector.training_due(5, "other_metric", 0, now).await);
    }

    #[tokio::test]
    async fn prune_drops_models_for_retired_targets() {
        let detector = AnomalyDetector::new(small_config());
        let now = Utc::now();
        let history: Vec<f64> = (0..50).map(|_| 1.0).collect();
        detector.train(1, "cpu_usage", &history, now).await;
        detector.train(2, "cpu_usage", &history, now).await;

        let active: HashSet<i64> = [1].into_iter().collect();
        let evicted = detector.prune(&active).await;
        assert_eq!(evicted, 1);
        assert_eq!(detector.cached_models().await, 1);
    }
}
