//! Shared runtime state for the HTTP layer and the pipeline loops: loop
//! health driving readiness, and per-target scheduling status mirrored
//! for the API. Persistent facts live in the store; this holds only what
//! has to be answered without a database round trip.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::model::{ConnectionStatus, MonitoredTarget};

#[derive(Debug, Clone, Serialize)]
pub struct LoopHealth {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LoopHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Live scheduling status of one target, as last reported by the
/// scheduler. `effective_interval_secs` reflects the adaptive interval,
/// not the configured base.
#[derive(Debug, Clone, Serialize)]
pub struct TargetRuntime {
    pub target_id: i64,
    pub name: String,
    pub connection_status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub effective_interval_secs: u64,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TargetRuntime {
    fn new(target: &MonitoredTarget, effective_interval: Duration) -> Self {
        Self {
            target_id: target.id,
            name: target.name.clone(),
            connection_status: target.connection_status,
            consecutive_failures: 0,
            effective_interval_secs: effective_interval.as_secs(),
            last_cycle_at: None,
            last_success_at: None,
            last_error: None,
        }
    }
}

#[derive(Default)]
struct SharedStateInner {
    loop_health: RwLock<HashMap<String, LoopHealth>>,
    targets: RwLock<HashMap<i64, TargetRuntime>>,
}

/// Shared state container handed to the HTTP layer and every loop.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedStateInner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SharedStateInner::default()),
        }
    }

    pub async fn record_loop_success(&self, loop_name: &str) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.last_success_at = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    pub async fn record_loop_failure(&self, loop_name: &str, error: String) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error);
    }

    pub async fn loop_health(&self) -> Vec<LoopHealth> {
        let mut health: Vec<LoopHealth> = self
            .inner
            .loop_health
            .read()
            .await
            .values()
            .cloned()
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// Readiness: every named loop has succeeded recently and is not in a
    /// failure streak.
    pub async fn is_ready(&self, loop_names: &[&str], max_staleness: Duration) -> bool {
        let health = self.inner.loop_health.read().await;
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(max_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop_names.iter().all(|name| {
            if let Some(entry) = health.get(*name) {
                if entry.consecutive_failures > 0 {
                    return false;
                }
                if let Some(last) = entry.last_success_at {
                    return now.signed_duration_since(last) <= staleness;
                }
                false
            } else {
                false
            }
        })
    }

    /// Register or refresh a target's runtime entry from its stored row.
    /// Counters survive a config refresh; name and interval track the
    /// latest load.
    pub async fn sync_target(&self, target: &MonitoredTarget, effective_interval: Duration) {
        let mut guard = self.inner.targets.write().await;
        match guard.get_mut(&target.id) {
            Some(entry) => {
                entry.name = target.name.clone();
                entry.effective_interval_secs = effective_interval.as_secs();
            }
            None => {
                guard.insert(target.id, TargetRuntime::new(target, effective_interval));
            }
        }
    }

    pub async fn record_cycle_success(&self, target_id: i64, effective_interval: Duration) {
        let mut guard = self.inner.targets.write().await;
        if let Some(entry) = guard.get_mut(&target_id) {
            let now = Utc::now();
            entry.connection_status = ConnectionStatus::Connected;
            entry.consecutive_failures = 0;
            entry.effective_interval_secs = effective_interval.as_secs();
            entry.last_cycle_at = Some(now);
            entry.last_success_at = Some(now);
            entry.last_error = None;
        }
    }

    pub async fn record_cycle_failure(
        &self,
        target_id: i64,
        error: &str,
        consecutive_failures: u32,
        effective_interval: Duration,
    ) {
        let mut guard = self.inner.targets.write().await;
        if let Some(entry) = guard.get_mut(&target_id) {
            entry.connection_status = ConnectionStatus::Error;
            entry.consecutive_failures = consecutive_failures;
            entry.effective_interval_secs = effective_interval.as_secs();
            entry.last_cycle_at = Some(Utc::now());
            entry.last_error = Some(error.to_string());
        }
    }

    /// Drop runtime entries for targets removed from the config.
    pub async fn retain_targets(&self, keep: &HashSet<i64>) {
        let mut guard = self.inner.targets.write().await;
        guard.retain(|id, _| keep.contains(id));
    }

    pub async fn target_runtime(&self, target_id: i64) -> Option<TargetRuntime> {
        self.inner.targets.read().await.get(&target_id).cloned()
    }

    pub async fn target_runtimes(&self) -> Vec<TargetRuntime> {
        let mut entries: Vec<TargetRuntime> =
            self.inner.targets.read().await.values().cloned().collect();
        entries.sort_by_key(|entry| entry.target_id);
        entries
    }

    pub async fn tracked_targets(&self) -> usize {
        self.inner.targets.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: i64, name: &str) -> MonitoredTarget {
        MonitoredTarget {
            id,
            name: name.to_string(),
            host: "db.internal".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            username: "monitor".to_string(),
            credential_ref: "PGFLEET_TARGET_PW".to_string(),
            monitoring_interval: Duration::from_secs(60),
            adaptive_interval: true,
            is_active: true,
            alert_thresholds: HashMap::new(),
            connection_status: ConnectionStatus::Pending,
            last_connected_at: None,
        }
    }

    #[tokio::test]
    async fn readiness_requires_recent_success_on_every_loop() {
        let state = SharedState::new();
        assert!(!state.is_ready(&["scheduler"], Duration::from_secs(60)).await);

        state.record_loop_success("scheduler").await;
        assert!(state.is_ready(&["scheduler"], Duration::from_secs(60)).await);
        assert!(
            !state
                .is_ready(&["scheduler", "training"], Duration::from_secs(60))
                .await
        );

        state
            .record_loop_failure("scheduler", "store unreachable".to_string())
            .await;
        assert!(!state.is_ready(&["scheduler"], Duration::from_secs(60)).await);

        // Success clears the streak.
        state.record_loop_success("scheduler").await;
        assert!(state.is_ready(&["scheduler"], Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn loop_health_snapshot_lists_every_loop_sorted() {
        let state = SharedState::new();
        state.record_loop_success("scheduler").await;
        state
            .record_loop_failure("retention", "store unreachable".to_string())
            .await;
        state
            .record_loop_failure("retention", "store unreachable".to_string())
            .await;

        let health = state.loop_health().await;
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].name, "retention");
        assert_eq!(health[0].consecutive_failures, 2);
        assert_eq!(health[0].last_error.as_deref(), Some("store unreachable"));
        assert_eq!(health[1].name, "scheduler");
        assert_eq!(health[1].consecutive_failures, 0);
        assert!(health[1].last_success_at.is_some());
    }

    #[tokio::test]
    async fn cycle_outcomes_update_target_runtime() {
        let state = SharedState::new();
        state
            .sync_target(&target(1, "orders-db"), Duration::from_secs(60))
            .await;

        state
            .record_cycle_failure(1, "connection refused", 2, Duration::from_secs(60))
            .await;
        let runtime = state.target_runtime(1).await.unwrap();
        assert_eq!(runtime.connection_status, ConnectionStatus::Error);
        assert_eq!(runtime.consecutive_failures, 2);
        assert!(runtime.last_success_at.is_none());

        state.record_cycle_success(1, Duration::from_secs(90)).await;
        let runtime = state.target_runtime(1).await.unwrap();
        assert_eq!(runtime.connection_status, ConnectionStatus::Connected);
        assert_eq!(runtime.consecutive_failures, 0);
        assert_eq!(runtime.effective_interval_secs, 90);
        assert!(runtime.last_success_at.is_some());
    }

    #[tokio::test]
    async fn retired_targets_are_dropped() {
        let state = SharedState::new();
        state
            .sync_target(&target(1, "a"), Duration::from_secs(60))
            .await;
        state
            .sync_target(&target(2, "b"), Duration::from_secs(60))
            .await;
        assert_eq!(state.tracked_targets().await, 2);

        let keep: HashSet<i64> = [2].into_iter().collect();
        state.retain_targets(&keep).await;
        assert_eq!(state.tracked_targets().await, 1);
        assert!(state.target_runtime(1).await.is_none());
        assert_eq!(state.target_runtimes().await[0].target_id, 2);
    }
}
