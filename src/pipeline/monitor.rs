//! One monitoring cycle for one target: resolve credentials, collect,
//! persist, evaluate thresholds, score anomalies against cached
//! baselines, and fold the candidates into the alert manager. Training
//! never happens here; the ml pool owns it.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, instrument};

use crate::alerts::CycleOutcome;
use crate::app::AppContext;
use crate::model::{ConnectionStatus, MonitoredTarget, metric};
use crate::{collector, evaluate, store};

#[instrument(skip_all, fields(target_id = target.id, target = %target.name))]
pub(super) async fn run_cycle(ctx: &AppContext, target: &MonitoredTarget) -> Result<CycleOutcome> {
    let fleet = ctx.fleet_name();
    let password = ctx
        .credentials
        .resolve(&target.credential_ref)
        .with_context(|| format!("cannot resolve credentials for target {}", target.id))?;

    let collection = collector::collect(target, &password, &ctx.config.collector).await?;
    drop(password);

    if !collection.batch.is_empty() || !collection.query_stats.is_empty() {
        let written = store::insert_cycle_with_retry(
            &ctx.pool,
            ctx.config.store.retry_budget,
            &collection.batch,
            &collection.query_stats,
            || ctx.metrics.inc_store_retry(fleet),
        )
        .await?;
        ctx.metrics.add_samples_written(fleet, written);
    }

    let mut candidates = evaluate::evaluate(
        &collection.batch,
        &target.alert_thresholds,
        &ctx.config.evaluator,
    );

    // Score against whatever baselines are cached; absent or expired
    // models abstain rather than block the cycle.
    let collected_at = collection.batch.collected_at;
    for reading in &collection.batch.readings {
        if !metric::BASELINED.contains(&reading.name.as_str()) {
            continue;
        }
        if let Some(candidate) = ctx
            .detector
            .score(
                target.id,
                &reading.name,
                reading.value,
                &reading.unit,
                &ctx.config.evaluator,
                collected_at,
            )
            .await
        {
            ctx.metrics.inc_anomaly(fleet, candidate.severity.as_str());
            candidates.push(candidate);
        }
    }

    let outcome = ctx
        .alerts
        .process_cycle(target.id, candidates, Utc::now())
        .await?;
    for (alert_type, severity) in &outcome.opened {
        ctx.metrics.inc_alert_opened(fleet, alert_type, severity);
    }
    if outcome.auto_resolved > 0 {
        ctx.metrics
            .add_auto_resolved(fleet, outcome.auto_resolved as u64);
    }

    store::update_target_status(
        &ctx.pool,
        target.id,
        ConnectionStatus::Connected,
        Some(Utc::now()),
    )
    .await?;

    debug!(
        samples = collection.batch.len(),
        query_stats = collection.query_stats.len(),
        candidates = outcome.candidates,
        opened = outcome.opened.len(),
        auto_resolved = outcome.auto_resolved,
        "cycle complete"
    );
    Ok(outcome)
}
