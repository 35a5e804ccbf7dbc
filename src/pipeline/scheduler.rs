//! Per-target cycle scheduling. A binary heap orders targets by
//! `next_due_at`; each tick drains finished-cycle reports, re-syncs the
//! target set from the store, and dispatches due targets onto the
//! monitoring pool. Stale heap entries (rescheduled or retired targets)
//! are dropped lazily when popped instead of being searched out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::CycleOutcome;
use crate::app::AppContext;
use crate::config::SchedulerConfig;
use crate::model::{
    AlertCandidate, AlertType, ConnectionStatus, MonitoredTarget, Provenance, Severity,
};
use crate::pipeline::{SCHEDULER_LOOP, monitor};
use crate::store::{self, AlertWrite};

/// Outcome of one dispatched cycle, reported back to the scheduler. The
/// dispatch task never touches scheduler state directly; intervals and
/// failure counts change only on the scheduler's own tick.
struct CycleReport {
    target_id: i64,
    disposition: Disposition,
}

enum Disposition {
    Completed(CycleOutcome),
    Failed(String),
}

struct TargetSlot {
    target: MonitoredTarget,
    effective_interval: Duration,
    next_due_at: DateTime<Utc>,
    consecutive_failures: u32,
    calm_streak: u32,
}

pub(super) fn spawn(ctx: AppContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick = ctx.config.scheduler.tick;
        info!(
            loop_name = SCHEDULER_LOOP,
            interval = ?tick,
            "starting pipeline loop"
        );

        let mut scheduler = Scheduler::new(ctx.clone());
        let mut ticker = time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let start = Instant::now();
            match scheduler.tick(Utc::now()).await {
                Ok(dispatched) => {
                    let elapsed = start.elapsed();
                    ctx.metrics.observe_duration(SCHEDULER_LOOP, elapsed);
                    if elapsed > tick {
                        warn!(
                            loop_name = SCHEDULER_LOOP,
                            elapsed = ?elapsed,
                            budget = ?tick,
                            "loop exceeded budget"
                        );
                    } else if dispatched > 0 {
                        info!(loop_name = SCHEDULER_LOOP, dispatched, "dispatched due targets");
                    } else {
                        debug!(loop_name = SCHEDULER_LOOP, elapsed = ?elapsed, "tick idle");
                    }
                    ctx.metrics.record_success(SCHEDULER_LOOP, true);
                    ctx.state.record_loop_success(SCHEDULER_LOOP).await;
                }
                Err(err) => {
                    error!(loop_name = SCHEDULER_LOOP, error = ?err, "scheduler tick failed");
                    ctx.metrics.record_success(SCHEDULER_LOOP, false);
                    ctx.metrics.inc_error(SCHEDULER_LOOP);
                    ctx.state
                        .record_loop_failure(SCHEDULER_LOOP, err.to_string())
                        .await;
                }
            }
        }
    })
}

struct Scheduler {
    ctx: AppContext,
    slots: HashMap<i64, TargetSlot>,
    due: BinaryHeap<Reverse<(DateTime<Utc>, i64)>>,
    reports_tx: mpsc::UnboundedSender<CycleReport>,
    reports_rx: mpsc::UnboundedReceiver<CycleReport>,
}

impl Scheduler {
    fn new(ctx: AppContext) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            slots: HashMap::new(),
            due: BinaryHeap::new(),
            reports_tx,
            reports_rx,
        }
    }

    /// One scheduling pass; returns how many cycles were dispatched.
    async fn tick(&mut self, now: DateTime<Utc>) -> Result<usize> {
        self.drain_reports().await;
        self.sync_targets(now).await?;
        let dispatched = self.dispatch_due(now);
        self.publish_gauges().await;
        Ok(dispatched)
    }

    async fn drain_reports(&mut self) {
        while let Ok(report) = self.reports_rx.try_recv() {
            self.apply_report(report).await;
        }
    }

    async fn apply_report(&mut self, report: CycleReport) {
        // The target may have been retired while its cycle was in flight.
        let Some(slot) = self.slots.get_mut(&report.target_id) else {
            return;
        };
        let policy = &self.ctx.config.scheduler;

        match report.disposition {
            Disposition::Completed(outcome) => {
                slot.consecutive_failures = 0;
                if slot.target.adaptive_interval {
                    let (interval, streak) =
                        adapt_interval(policy, slot.effective_interval, slot.calm_streak, &outcome);
                    if interval != slot.effective_interval {
                        debug!(
                            target_id = report.target_id,
                            interval = ?interval,
                            escalated = outcome.escalated,
                            "adjusted monitoring interval"
                        );
                    }
                    slot.effective_interval = interval;
                    slot.calm_streak = streak;
                }
                self.ctx
                    .state
                    .record_cycle_success(report.target_id, slot.effective_interval)
                    .await;
            }
            Disposition::Failed(error) => {
                slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
                slot.calm_streak = 0;
                let failures = slot.consecutive_failures;
                self.ctx
                    .state
                    .record_cycle_failure(
                        report.target_id,
                        &error,
                        failures,
                        slot.effective_interval,
                    )
                    .await;
                if let Some(severity) = failure_severity(policy, failures) {
                    self.raise_connection_alert(report.target_id, failures, severity, &error)
                        .await;
                }
            }
        }
    }

    /// Open (or refresh, escalating severity) the connection alert for a
    /// repeatedly failing target. The next successful cycle produces no
    /// `connection` candidate, so the regular sweep auto-resolves it.
    async fn raise_connection_alert(
        &self,
        target_id: i64,
        failures: u32,
        severity: Severity,
        error: &str,
    ) {
        let candidate = AlertCandidate {
            target_id,
            alert_type: AlertType::Connection,
            key: "connection".to_string(),
            severity,
            title: "target unreachable".to_string(),
            description: format!("{failures} consecutive collection failures; last: {error}"),
            metric_value: None,
            threshold_value: None,
            provenance: Provenance::Scheduler,
            detail: Some(json!({ "consecutive_failures": failures })),
        };
        match self.ctx.alerts.raise(candidate, Utc::now()).await {
            Ok(AlertWrite::Opened(_)) => {
                self.ctx.metrics.inc_alert_opened(
                    self.ctx.fleet_name(),
                    AlertType::Connection.as_str(),
                    severity.as_str(),
                );
            }
            Ok(AlertWrite::Refreshed(_)) => {}
            Err(err) => {
                warn!(target_id, error = ?err, "failed to record connection alert");
            }
        }
    }

    /// Reconcile the slot map with the store's active target set. New
    /// targets are due immediately; a changed configured interval resets
    /// any adapted one, since the operator's edit should win.
    async fn sync_targets(&mut self, now: DateTime<Utc>) -> Result<()> {
        let targets = store::load_active_targets(&self.ctx.pool, &self.ctx.config.scheduler).await?;
        let keep: HashSet<i64> = targets.iter().map(|target| target.id).collect();

        let before = self.slots.len();
        self.slots.retain(|id, _| keep.contains(id));
        if self.slots.len() < before {
            info!(
                retired = before - self.slots.len(),
                "dropped retired targets from the schedule"
            );
            self.ctx.state.retain_targets(&keep).await;
        }

        for target in targets {
            match self.slots.get_mut(&target.id) {
                Some(slot) => {
                    if !target.adaptive_interval
                        || target.monitoring_interval != slot.target.monitoring_interval
                    {
                        slot.effective_interval = target.monitoring_interval;
                    }
                    slot.target = target;
                }
                None => {
                    let effective_interval = target.monitoring_interval;
                    info!(
                        target_id = target.id,
                        name = %target.name,
                        interval = ?effective_interval,
                        "scheduling new target"
                    );
                    self.due.push(Reverse((now, target.id)));
                    self.slots.insert(
                        target.id,
                        TargetSlot {
                            target,
                            effective_interval,
                            next_due_at: now,
                            consecutive_failures: 0,
                            calm_streak: 0,
                        },
                    );
                }
            }
        }

        for slot in self.slots.values() {
            self.ctx
                .state
                .sync_target(&slot.target, slot.effective_interval)
                .await;
        }
        Ok(())
    }

    fn dispatch_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut dispatched = 0;
        while let Some(Reverse((due_at, target_id))) = self.due.peek().copied() {
            if due_at > now {
                break;
            }
            self.due.pop();
            let Some(slot) = self.slots.get_mut(&target_id) else {
                continue;
            };
            if slot.next_due_at != due_at {
                // Superseded by a newer heap entry for this target.
                continue;
            }

            slot.next_due_at = now + interval_to_chrono(slot.effective_interval);
            self.due.push(Reverse((slot.next_due_at, target_id)));
            dispatched += 1;

            let ctx = self.ctx.clone();
            let target = slot.target.clone();
            let reports = self.reports_tx.clone();
            tokio::spawn(dispatch(ctx, target, reports));
        }
        dispatched
    }

    async fn publish_gauges(&self) {
        self.ctx
            .metrics
            .set_active_targets(self.ctx.fleet_name(), self.slots.len() as i64);
        match store::count_active_alerts_by_severity(&self.ctx.pool).await {
            Ok(by_severity) => {
                self.ctx
                    .metrics
                    .set_active_alerts(self.ctx.fleet_name(), &by_severity);
            }
            Err(err) => {
                debug!(error = ?err, "failed to refresh active alert gauge");
            }
        }
    }
}

/// Run one cycle under a monitoring-pool permit, enforcing the soft and
/// hard runtime limits, then report the disposition back.
async fn dispatch(
    ctx: AppContext,
    target: MonitoredTarget,
    reports: mpsc::UnboundedSender<CycleReport>,
) {
    let target_id = target.id;
    let permit = match ctx.pools.monitoring.clone().acquire_owned().await {
        Ok(permit) => permit,
        // Closed semaphore means shutdown is underway.
        Err(_) => return,
    };

    let soft = ctx.config.pools.monitoring_soft_limit;
    let hard = ctx.config.pools.monitoring_hard_limit;
    let started = Instant::now();

    let cycle = monitor::run_cycle(&ctx, &target);
    tokio::pin!(cycle);

    let result = tokio::select! {
        result = &mut cycle => result,
        _ = time::sleep(soft) => {
            warn!(target_id, limit = ?soft, "monitoring cycle passed its soft limit");
            match time::timeout(hard.saturating_sub(soft), &mut cycle).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("cycle aborted at the {hard:?} hard limit")),
            }
        }
    };
    drop(permit);

    ctx.metrics
        .observe_cycle_duration(ctx.fleet_name(), started.elapsed());

    let disposition = match result {
        Ok(outcome) => {
            ctx.metrics.inc_cycle(ctx.fleet_name(), true);
            Disposition::Completed(outcome)
        }
        Err(err) => {
            ctx.metrics.inc_cycle(ctx.fleet_name(), false);
            warn!(target_id, error = ?err, "monitoring cycle failed");
            if let Err(status_err) =
                store::update_target_status(&ctx.pool, target_id, ConnectionStatus::Error, None)
                    .await
            {
                warn!(target_id, error = ?status_err, "failed to record error status");
            }
            Disposition::Failed(err.to_string())
        }
    };
    if reports.send(CycleReport { target_id, disposition }).is_err() {
        debug!(target_id, "scheduler gone; cycle report dropped");
    }
}

fn interval_to_chrono(interval: Duration) -> chrono::Duration {
    chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// Next (effective_interval, calm_streak) after a completed cycle. An
/// escalated candidate halves the interval; `relax_after` consecutive
/// alert-free cycles grow it by one step; a plain breach just resets the
/// streak. Always clamped to the configured band.
fn adapt_interval(
    policy: &SchedulerConfig,
    current: Duration,
    calm_streak: u32,
    outcome: &CycleOutcome,
) -> (Duration, u32) {
    if outcome.escalated {
        (policy.clamp_interval(current / 2), 0)
    } else if outcome.alert_free() {
        let streak = calm_streak + 1;
        if streak >= policy.relax_after {
            (policy.clamp_interval(current + policy.growth_step), 0)
        } else {
            (current, streak)
        }
    } else {
        (current, 0)
    }
}

fn failure_severity(policy: &SchedulerConfig, failures: u32) -> Option<Severity> {
    if failures >= policy.failures_before_critical {
        Some(Severity::Critical)
    } else if failures >= policy.failures_before_alert {
        Some(Severity::High)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm() -> CycleOutcome {
        CycleOutcome::default()
    }

    fn breached(escalated: bool) -> CycleOutcome {
        CycleOutcome {
            candidates: 1,
            escalated,
            ..CycleOutcome::default()
        }
    }

    #[test]
    fn escalation_halves_interval_down_to_floor() {
        let policy = SchedulerConfig::default();
        let (interval, streak) =
            adapt_interval(&policy, Duration::from_secs(120), 2, &breached(true));
        assert_eq!(interval, Duration::from_secs(60));
        assert_eq!(streak, 0);

        // Already at the floor: halving cannot go below min_interval.
        let (interval, _) = adapt_interval(&policy, Duration::from_secs(30), 0, &breached(true));
        assert_eq!(interval, policy.min_interval);
    }

    #[test]
    fn calm_streak_relaxes_after_three_cycles() {
        let policy = SchedulerConfig::default();
        let base = Duration::from_secs(60);

        let (interval, streak) = adapt_interval(&policy, base, 0, &calm());
        assert_eq!((interval, streak), (base, 1));
        let (interval, streak) = adapt_interval(&policy, base, 1, &calm());
        assert_eq!((interval, streak), (base, 2));
        let (interval, streak) = adapt_interval(&policy, base, 2, &calm());
        assert_eq!(interval, Duration::from_secs(90));
        assert_eq!(streak, 0, "streak restarts after a growth step");
    }

    #[test]
    fn growth_clamps_at_max_interval() {
        let policy = SchedulerConfig::default();
        let (interval, _) = adapt_interval(&policy, policy.max_interval, 2, &calm());
        assert_eq!(interval, policy.max_interval);
    }

    #[test]
    fn plain_breach_resets_streak_without_tightening() {
        let policy = SchedulerConfig::default();
        let base = Duration::from_secs(120);
        let (interval, streak) = adapt_interval(&policy, base, 2, &breached(false));
        assert_eq!(interval, base);
        assert_eq!(streak, 0);
    }

    #[test]
    fn failure_severity_steps_high_then_critical() {
        let policy = SchedulerConfig::default();
        assert_eq!(failure_severity(&policy, 2), None);
        assert_eq!(failure_severity(&policy, 3), Some(Severity::High));
        assert_eq!(failure_severity(&policy, 4), Some(Severity::High));
        assert_eq!(failure_severity(&policy, 5), Some(Severity::Critical));
    }
}
