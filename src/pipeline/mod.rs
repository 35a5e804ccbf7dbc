use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::app::AppContext;

mod ml;
mod monitor;
mod scheduler;

pub const SCHEDULER_LOOP: &str = "scheduler";
pub const TRAINING_LOOP: &str = "training";
pub const RECOMMENDATION_LOOP: &str = "recommendations";
pub const RETENTION_LOOP: &str = "retention";

type LoopFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type LoopFn = fn(AppContext) -> LoopFuture;

/// Spawn the scheduler and the background sweeps; returns their join
/// handles.
pub fn spawn_all(ctx: AppContext) -> Vec<JoinHandle<()>> {
    let cadence = ctx.config.scheduler.clone();
    let ml_budget = ctx.config.pools.ml_soft_limit;

    vec![
        scheduler::spawn(ctx.clone()),
        spawn_loop(
            ctx.clone(),
            TRAINING_LOOP,
            cadence.training_interval,
            ml_budget,
            run_training,
        ),
        spawn_loop(
            ctx.clone(),
            RECOMMENDATION_LOOP,
            cadence.recommendation_interval,
            ml_budget,
            run_recommendations,
        ),
        spawn_loop(
            ctx,
            RETENTION_LOOP,
            cadence.retention_interval,
            Duration::from_secs(60),
            run_retention,
        ),
    ]
}

fn spawn_loop(
    ctx: AppContext,
    loop_name: &'static str,
    interval: Duration,
    budget: Duration,
    run_fn: LoopFn,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            loop_name,
            interval = ?interval,
            budget = ?budget,
            "starting pipeline loop"
        );

        // tokio::time::interval() completes the first tick immediately,
        // so every loop executes once on startup before settling into
        // its cadence.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = run_once(ctx.clone(), loop_name, budget, run_fn).await {
                error!(loop_name, error = ?err, "pipeline loop iteration failed");
            }
        }
    })
}

async fn run_once(
    ctx: AppContext,
    loop_name: &'static str,
    budget: Duration,
    run_fn: LoopFn,
) -> Result<()> {
    let start = Instant::now();
    match run_fn(ctx.clone()).await {
        Ok(_) => {
            let elapsed = start.elapsed();
            ctx.metrics.observe_duration(loop_name, elapsed);
            if elapsed > budget {
                warn!(
                    loop_name,
                    elapsed = ?elapsed,
                    budget = ?budget,
                    "loop exceeded budget"
                );
            } else {
                info!(
                    loop_name,
                    elapsed = ?elapsed,
                    "loop completed successfully"
                );
            }
            ctx.metrics.record_success(loop_name, true);
            ctx.state.record_loop_success(loop_name).await;
            Ok(())
        }
        Err(err) => {
            ctx.metrics.record_success(loop_name, false);
            ctx.metrics.inc_error(loop_name);
            ctx.state
                .record_loop_failure(loop_name, err.to_string())
                .await;
            Err(err)
        }
    }
}

fn run_training(ctx: AppContext) -> LoopFuture {
    Box::pin(async move {
        let hard = ctx.config.pools.ml_hard_limit;
        match time::timeout(hard, ml::train_baselines(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "training sweep aborted at the {hard:?} hard limit"
            )),
        }
    })
}

fn run_recommendations(ctx: AppContext) -> LoopFuture {
    Box::pin(async move {
        let hard = ctx.config.pools.ml_hard_limit;
        match time::timeout(hard, ml::refresh_recommendations(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "recommendation sweep aborted at the {hard:?} hard limit"
            )),
        }
    })
}

fn run_retention(ctx: AppContext) -> LoopFuture {
    Box::pin(async move { ml::sweep_retention(&ctx).await })
}
