//! Alert lifecycle. Candidates from the threshold evaluator, the anomaly
//! detector, and the scheduler's failure escalation all funnel through
//! here: merge per key, open or refresh the active row, auto-resolve keys
//! that went quiet, and serve the operator commands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::db::DbPool;
use crate::model::{AlertCandidate, AlertKey, MergedCandidate};
use crate::store::{self, AlertWrite, CommandOutcome};

/// What one completed cycle did to a target's alert set. The scheduler
/// reads this to drive the adaptive interval.
#[derive(Debug, Default, Clone)]
pub struct CycleOutcome {
    pub candidates: usize,
    /// (alert_type, severity) per newly opened alert.
    pub opened: Vec<(String, &'static str)>,
    pub refreshed: usize,
    pub auto_resolved: usize,
    /// Any merged candidate reached high or critical.
    pub escalated: bool,
}

impl CycleOutcome {
    pub fn alert_free(&self) -> bool {
        self.candidates == 0
    }
}

pub struct AlertManager {
    pool: DbPool,
    key_locks: Mutex<HashMap<AlertKey, Arc<Mutex<()>>>>,
}

impl AlertManager {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one completed cycle's candidates into persistent alert state
    /// for a target. Writes for a given key run under that key's lock, so
    /// a threshold candidate and an anomaly candidate arriving together
    /// cannot interleave an open with a refresh. Active alerts whose key
    /// produced no candidate this cycle resolve automatically.
    #[instrument(skip_all, fields(target_id = target_id))]
    pub async fn process_cycle(
        &self,
        target_id: i64,
        candidates: Vec<AlertCandidate>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome> {
        let merged = merge_candidates(candidates);
        let mut outcome = CycleOutcome {
            candidates: merged.len(),
            escalated: merged.iter().any(|m| m.severity.is_escalated()),
            ..CycleOutcome::default()
        };

        let mut live_keys: HashSet<AlertKey> = HashSet::with_capacity(merged.len());
        for candidate in &merged {
            match self.upsert_locked(candidate, now).await? {
                AlertWrite::Opened(id) => {
                    info!(
                        target_id,
                        alert_id = id,
                        alert_type = candidate.key.alert_type.as_str(),
                        key = %candidate.key.key,
                        severity = candidate.severity.as_str(),
                        "opened alert"
                    );
                    outcome.opened.push((
                        candidate.key.alert_type.as_str().to_string(),
                        candidate.severity.as_str(),
                    ));
                }
                AlertWrite::Refreshed(id) => {
                    debug!(
                        target_id,
                        alert_id = id,
                        key = %candidate.key.key,
                        severity = candidate.severity.as_str(),
                        "refreshed active alert"
                    );
                    outcome.refreshed += 1;
                }
            }
            live_keys.insert(candidate.key.clone());
        }

        let active = store::active_alert_keys(&self.pool, target_id).await?;
        let quiet = quiet_ids(active, &live_keys);
        if !quiet.is_empty() {
            let resolved = store::resolve_alerts_by_id(&self.pool, &quiet, now).await?;
            outcome.auto_resolved = resolved as usize;
            info!(target_id, resolved, "auto-resolved alerts whose key went quiet");
        }

        self.prune_locks().await;
        Ok(outcome)
    }

    /// Open or refresh a single alert without the auto-resolve sweep.
    /// Used for failure escalation: a failed cycle observed nothing, so it
    /// must not clear the target's other alerts.
    pub async fn raise(&self, candidate: AlertCandidate, now: DateTime<Utc>) -> Result<AlertWrite> {
        let merged = merge_candidates(vec![candidate]);
        // merge of one candidate always yields exactly one entry
        let Some(single) = merged.first() else {
            anyhow::bail!("empty candidate merge");
        };
        let write = self.upsert_locked(single, now).await?;
        if let AlertWrite::Opened(id) = write {
            info!(
                target_id = single.key.target_id,
                alert_id = id,
                alert_type = single.key.alert_type.as_str(),
                severity = single.severity.as_str(),
                "opened alert"
            );
        }
        self.prune_locks().await;
        Ok(write)
    }

    pub async fn acknowledge(&self, alert_id: i64) -> Result<CommandOutcome> {
        store::acknowledge_alert(&self.pool, alert_id, Utc::now()).await
    }

    pub async fn resolve(&self, alert_id: i64) -> Result<CommandOutcome> {
        store::resolve_alert(&self.pool, alert_id, Utc::now()).await
    }

    async fn upsert_locked(
        &self,
        candidate: &MergedCandidate,
        now: DateTime<Utc>,
    ) -> Result<AlertWrite> {
        let guard = {
            let mut locks = self.key_locks.lock().await;
            locks.entry(candidate.key.clone()).or_default().clone()
        };
        let _held = guard.lock().await;
        store::upsert_alert(&self.pool, candidate, now).await
    }

    /// Drop lock entries nobody holds; keys come and go with targets.
    async fn prune_locks(&self) {
        let mut locks = self.key_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Collapse one cycle's candidates to at most one per alert key, in
/// first-seen order. A higher severity replaces the headline fields;
/// provenance tags and per-detector detail accumulate.
pub fn merge_candidates(candidates: Vec<AlertCandidate>) -> Vec<MergedCandidate> {
    let mut merged: Vec<MergedCandidate> = Vec::new();
    let mut by_key: HashMap<AlertKey, usize> = HashMap::new();

    for candidate in candidates {
        let key = candidate.alert_key();
        match by_key.get(&key) {
            Some(&slot) => fold_candidate(&mut merged[slot], candidate),
            None => {
                by_key.insert(key.clone(), merged.len());
                merged.push(start_merge(key, candidate));
            }
        }
    }
    merged
}

/// Ids of active alerts whose key produced no candidate this cycle. A
/// completed cycle observed the whole metric set, so a key it did not
/// re-confirm has recovered.
fn quiet_ids(active: Vec<(i64, AlertKey)>, live: &HashSet<AlertKey>) -> Vec<i64> {
    active
        .into_iter()
        .filter(|(_, key)| !live.contains(key))
        .map(|(id, _)| id)
        .collect()
}

fn start_merge(key: AlertKey, candidate: AlertCandidate) -> MergedCandidate {
    let mut detail = serde_json::Map::new();
    if let Some(value) = candidate.detail {
        detail.insert(candidate.provenance.as_str().to_string(), value);
    }
    MergedCandidate {
        key,
        severity: candidate.severity,
        title: candidate.title,
        description: candidate.description,
        metric_value: candidate.metric_value,
        threshold_value: candidate.threshold_value,
        provenance: vec![candidate.provenance],
        detail: serde_json::Value::Object(detail),
    }
}

fn fold_candidate(merged: &mut MergedCandidate, candidate: AlertCandidate) {
    if candidate.severity > merged.severity {
        merged.severity = candidate.severity;
        merged.title = candidate.title;
        merged.description = candidate.description;
        merged.metric_value = candidate.metric_value;
        if candidate.threshold_value.is_some() {
            merged.threshold_value = candidate.threshold_value;
        }
    } else if merged.threshold_value.is_none() {
        merged.threshold_value = candidate.threshold_value;
    }

    if !merged.provenance.contains(&candidate.provenance) {
        merged.provenance.push(candidate.provenance);
    }
    if let Some(value) = candidate.detail {
        if let Some(object) = merged.detail.as_object_mut() {
            object.insert(candidate.provenance.as_str().to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertType, Provenance, Severity};
    use serde_json::json;

    fn candidate(
        alert_type: AlertType,
        key: &str,
        severity: Severity,
        provenance: Provenance,
    ) -> AlertCandidate {
        AlertCandidate {
            target_id: 1,
            alert_type,
            key: key.to_string(),
            severity,
            title: format!("{key} {}", severity.as_str()),
            description: format!("{key} breached"),
            metric_value: Some(85.0),
            threshold_value: match provenance {
                Provenance::Threshold => Some(90.0),
                _ => None,
            },
            provenance,
            detail: match provenance {
                Provenance::Anomaly => Some(json!({"z_score": 4.2})),
                _ => None,
            },
        }
    }

    #[test]
    fn merge_takes_max_severity_and_keeps_both_tags() {
        let merged = merge_candidates(vec![
            candidate(
                AlertType::Performance,
                "cpu_usage",
                Severity::Medium,
                Provenance::Threshold,
            ),
            candidate(
                AlertType::Performance,
                "cpu_usage",
                Severity::High,
                Provenance::Anomaly,
            ),
        ]);

        assert_eq!(merged.len(), 1);
        let alert = &merged[0];
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(
            alert.provenance,
            vec![Provenance::Threshold, Provenance::Anomaly]
        );
        // Threshold evidence survives the escalation.
        assert_eq!(alert.threshold_value, Some(90.0));
        assert_eq!(alert.detail["anomaly"]["z_score"], json!(4.2));
    }

    #[test]
    fn lower_severity_arrival_cannot_downgrade() {
        let merged = merge_candidates(vec![
            candidate(
                AlertType::Performance,
                "locks_count",
                Severity::Critical,
                Provenance::Threshold,
            ),
            candidate(
                AlertType::Performance,
                "locks_count",
                Severity::Medium,
                Provenance::Anomaly,
            ),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].severity, Severity::Critical);
        assert_eq!(merged[0].provenance.len(), 2);
    }

    #[test]
    fn distinct_alert_types_stay_separate() {
        let merged = merge_candidates(vec![
            candidate(
                AlertType::Performance,
                "cpu_usage",
                Severity::Medium,
                Provenance::Threshold,
            ),
            candidate(
                AlertType::Anomaly,
                "cpu_usage",
                Severity::High,
                Provenance::Anomaly,
            ),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key.alert_type, AlertType::Performance);
        assert_eq!(merged[1].key.alert_type, AlertType::Anomaly);
    }

    #[test]
    fn repeated_tag_recorded_once() {
        let merged = merge_candidates(vec![
            candidate(
                AlertType::Performance,
                "disk_usage",
                Severity::Medium,
                Provenance::Threshold,
            ),
            candidate(
                AlertType::Performance,
                "disk_usage",
                Severity::Medium,
                Provenance::Threshold,
            ),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].provenance, vec![Provenance::Threshold]);
    }

    fn active_key(alert_type: AlertType, key: &str) -> AlertKey {
        AlertKey {
            target_id: 1,
            alert_type,
            key: key.to_string(),
        }
    }

    #[test]
    fn quiet_sweep_resolves_only_keys_without_candidates() {
        let active = vec![
            (11, active_key(AlertType::Performance, "cpu_usage")),
            (12, active_key(AlertType::Connection, "connection")),
        ];
        let mut live = HashSet::new();
        live.insert(active_key(AlertType::Performance, "cpu_usage"));

        // cpu_usage re-confirmed, the connection alert recovered.
        assert_eq!(quiet_ids(active, &live), vec![12]);
    }

    #[test]
    fn calm_cycle_resolves_every_active_alert() {
        let active = vec![
            (7, active_key(AlertType::Performance, "locks_count")),
            (8, active_key(AlertType::Anomaly, "cache_hit_ratio")),
        ];

        assert_eq!(quiet_ids(active, &HashSet::new()), vec![7, 8]);
    }

    #[test]
    fn quiet_sweep_separates_alert_types_on_one_metric() {
        let active = vec![(3, active_key(AlertType::Anomaly, "cpu_usage"))];
        let mut live = HashSet::new();
        live.insert(active_key(AlertType::Performance, "cpu_usage"));

        assert_eq!(quiet_ids(active, &live), vec![3]);
    }

    #[test]
    fn outcome_tracks_escalation() {
        let outcome = CycleOutcome {
            candidates: 2,
            escalated: true,
            ..CycleOutcome::default()
        };
        assert!(!outcome.alert_free());
        let calm = CycleOutcome::default();
        assert!(calm.alert_free());
    }
}
