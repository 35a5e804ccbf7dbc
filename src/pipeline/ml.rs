//! The ml-pool sweeps: baseline (re)training, recommendation rule
//! evaluation, and retention purges. Per-pair and per-target store
//! errors are logged and skipped so one broken series cannot starve the
//! rest of the fleet.

use std::collections::HashSet;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::anomaly::TrainOutcome;
use crate::app::AppContext;
use crate::model::metric;
use crate::recommend::{self, TargetWindow};
use crate::store;

pub(super) async fn train_baselines(ctx: &AppContext) -> Result<()> {
    let _permit = ctx.pools.ml.acquire().await?;
    let targets = store::load_active_targets(&ctx.pool, &ctx.config.scheduler).await?;
    let active: HashSet<i64> = targets.iter().map(|target| target.id).collect();
    let now = Utc::now();
    let fleet = ctx.fleet_name();

    let mut trained = 0usize;
    let mut skipped = 0usize;
    for target in &targets {
        for metric_name in metric::BASELINED {
            match train_pair(ctx, target.id, metric_name, now).await {
                Ok(Some(TrainOutcome::Trained { samples })) => {
                    trained += 1;
                    ctx.metrics.inc_training(fleet, "trained");
                    debug!(
                        target_id = target.id,
                        metric = metric_name,
                        samples,
                        "trained baseline"
                    );
                }
                Ok(Some(TrainOutcome::Insufficient { samples })) => {
                    ctx.metrics.inc_training(fleet, "insufficient");
                    debug!(
                        target_id = target.id,
                        metric = metric_name,
                        samples,
                        "too little history to train"
                    );
                }
                Ok(None) => skipped += 1,
                Err(err) => {
                    ctx.metrics.inc_training(fleet, "error");
                    warn!(
                        target_id = target.id,
                        metric = metric_name,
                        error = ?err,
                        "baseline training failed"
                    );
                }
            }
        }
    }

    let pruned = ctx.detector.prune(&active).await;
    if pruned > 0 {
        debug!(pruned, "dropped baselines for retired targets");
    }
    ctx.metrics
        .set_baseline_models(fleet, ctx.detector.cached_models().await as i64);
    info!(
        targets = targets.len(),
        trained, skipped, "baseline training sweep complete"
    );
    Ok(())
}

/// Train one (target, metric) pair if it is due. `None` means the cached
/// model is still fresh enough.
async fn train_pair(
    ctx: &AppContext,
    target_id: i64,
    metric_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<TrainOutcome>> {
    let fresh = match ctx.detector.trained_at(target_id, metric_name).await {
        Some(trained_at) => {
            store::count_samples_since(&ctx.pool, target_id, metric_name, trained_at).await?
        }
        // No model yet; training_due fires regardless of the count.
        None => 0,
    };
    if !ctx
        .detector
        .training_due(target_id, metric_name, fresh, now)
        .await
    {
        return Ok(None);
    }

    let values = store::recent_values(
        &ctx.pool,
        target_id,
        metric_name,
        ctx.config.anomaly.window as i64,
    )
    .await?;
    Ok(Some(
        ctx.detector.train(target_id, metric_name, &values, now).await,
    ))
}

pub(super) async fn refresh_recommendations(ctx: &AppContext) -> Result<()> {
    let _permit = ctx.pools.ml.acquire().await?;
    let targets = store::load_active_targets(&ctx.pool, &ctx.config.scheduler).await?;
    let now = Utc::now();
    let fleet = ctx.fleet_name();

    let mut emitted = 0usize;
    for target in &targets {
        let window = match assemble_window(ctx, target.id, now).await {
            Ok(window) => window,
            Err(err) => {
                warn!(
                    target_id = target.id,
                    error = ?err,
                    "failed to assemble evidence window"
                );
                continue;
            }
        };

        for draft in
            recommend::generate_recommendations(target.id, &window, &ctx.config.recommendations)
        {
            match store::upsert_recommendation(&ctx.pool, &draft, now).await {
                Ok(true) => {
                    emitted += 1;
                    ctx.metrics.inc_recommendation(
                        fleet,
                        draft.category.as_str(),
                        draft.priority.as_str(),
                    );
                    info!(
                        target_id = target.id,
                        rule = %draft.rule,
                        priority = draft.priority.as_str(),
                        "new recommendation"
                    );
                }
                // Refresh of an already-open row.
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        target_id = target.id,
                        rule = %draft.rule,
                        error = ?err,
                        "failed to persist recommendation"
                    );
                }
            }
        }
    }

    info!(
        targets = targets.len(),
        emitted, "recommendation sweep complete"
    );
    Ok(())
}

/// Windowed evidence for the rule generators, all read from the store.
async fn assemble_window(
    ctx: &AppContext,
    target_id: i64,
    now: DateTime<Utc>,
) -> Result<TargetWindow> {
    let cfg = &ctx.config.recommendations;
    let utilization_since = window_start(now, cfg.utilization_window);
    let trend_since = window_start(now, cfg.trend_window);

    Ok(TargetWindow {
        mean_cache_hit_ratio: store::mean_metric_since(
            &ctx.pool,
            target_id,
            metric::CACHE_HIT_RATIO,
            utilization_since,
        )
        .await?,
        mean_connection_utilization: store::mean_metric_since(
            &ctx.pool,
            target_id,
            metric::CONNECTION_UTILIZATION,
            utilization_since,
        )
        .await?,
        cpu_series: store::series_since(&ctx.pool, target_id, metric::CPU_USAGE, trend_since)
            .await?,
        memory_series: store::series_since(&ctx.pool, target_id, metric::MEMORY_USAGE, trend_since)
            .await?,
        deadlock_bounds: store::window_bounds(
            &ctx.pool,
            target_id,
            metric::DEADLOCKS_COUNT,
            trend_since,
        )
        .await?,
        query_stats: store::latest_query_stats(&ctx.pool, target_id).await?,
    })
}

pub(super) async fn sweep_retention(ctx: &AppContext) -> Result<()> {
    let days = ctx.config.retention.retention_days;
    let cutoff = window_start(Utc::now(), StdDuration::from_secs(u64::from(days) * 86_400));
    let summary = store::purge_before(&ctx.pool, cutoff).await?;

    let fleet = ctx.fleet_name();
    ctx.metrics.add_purged(fleet, "samples", summary.samples);
    ctx.metrics
        .add_purged(fleet, "query_stats", summary.query_stats);
    ctx.metrics.add_purged(fleet, "alerts", summary.alerts);
    ctx.metrics
        .add_purged(fleet, "recommendations", summary.recommendations);

    if summary.total() > 0 {
        info!(
            cutoff = %cutoff,
            samples = summary.samples,
            query_stats = summary.query_stats,
            alerts = summary.alerts,
            recommendations = summary.recommendations,
            "purged aged history"
        );
    } else {
        debug!(cutoff = %cutoff, "nothing to purge");
    }
    Ok(())
}

/// `now - window`, saturating instead of panicking on absurd spans.
fn window_start(now: DateTime<Utc>, window: StdDuration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
