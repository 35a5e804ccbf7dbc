use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::model::{Alert, Recommendation, SamplePoint};
use crate::pipeline::SCHEDULER_LOOP;
use crate::state::{LoopHealth, TargetRuntime};
use crate::store::{self, CommandOutcome};

/// Readiness tracks the scheduler only; the slow sweeps going stale
/// should not fail the probe.
const READY_LOOPS: &[&str] = &[SCHEDULER_LOOP];
const READY_STALENESS: Duration = Duration::from_secs(60);

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/overview", get(get_overview))
        .route("/targets", get(get_targets))
        .route("/alerts", get(get_alerts))
        .route("/alerts/:id/acknowledge", post(post_acknowledge_alert))
        .route("/alerts/:id/resolve", post(post_resolve_alert))
        .route("/recommendations", get(get_recommendations))
        .route("/recommendations/:id/apply", post(post_apply_recommendation))
        .route("/history/:target_id/:metric", get(get_history));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn get_healthz(State(ctx): State<AppContext>) -> StatusCode {
    let is_ready = ctx.state.is_ready(READY_LOOPS, READY_STALENESS).await;

    if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(serde::Serialize)]
struct OverviewResponse {
    fleet: String,
    targets_by_status: BTreeMap<String, i64>,
    active_alerts_by_severity: BTreeMap<String, i64>,
    loops: Vec<LoopHealth>,
    #[serde(with = "chrono::serde::ts_seconds")]
    generated_at: DateTime<Utc>,
}

async fn get_overview(
    State(ctx): State<AppContext>,
) -> Result<Json<OverviewResponse>, StatusCode> {
    let targets = store::count_targets_by_status(&ctx.pool)
        .await
        .map_err(internal)?;
    let alerts = store::count_active_alerts_by_severity(&ctx.pool)
        .await
        .map_err(internal)?;

    Ok(Json(OverviewResponse {
        fleet: ctx.fleet_name().to_string(),
        targets_by_status: targets.into_iter().collect(),
        active_alerts_by_severity: alerts.into_iter().collect(),
        loops: ctx.state.loop_health().await,
        generated_at: Utc::now(),
    }))
}

async fn get_targets(State(ctx): State<AppContext>) -> Json<Vec<TargetRuntime>> {
    Json(ctx.state.target_runtimes().await)
}

async fn get_alerts(
    State(ctx): State<AppContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Alert>>, StatusCode> {
    let active_only: bool = params
        .get("active")
        .and_then(|v| v.parse().ok())
        .unwrap_or(true);
    let limit = limit_param(&params, 100);

    let alerts = store::list_alerts(&ctx.pool, active_only, limit)
        .await
        .map_err(internal)?;
    Ok(Json(alerts))
}

async fn get_recommendations(
    State(ctx): State<AppContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Recommendation>>, StatusCode> {
    // ?applied=false (the default) hides rows an operator already acted on.
    let include_applied: bool = params
        .get("applied")
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);
    let limit = limit_param(&params, 100);

    let recommendations = store::list_recommendations(&ctx.pool, !include_applied, limit)
        .await
        .map_err(internal)?;
    Ok(Json(recommendations))
}

#[derive(serde::Serialize)]
struct HistoryResponse {
    target_id: i64,
    metric: String,
    points: Vec<SamplePoint>,
    downsampled: bool,
}

/// High-resolution sample series for one target metric.
/// Query params:
///   ?window=24h | 1h | 6h (default 24h)
///   ?max_points=1000 (downsample target)
async fn get_history(
    State(ctx): State<AppContext>,
    Path((target_id, metric)): Path<(i64, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let window = params.get("window").map(String::as_str).unwrap_or("24h");
    let max_points: usize = params
        .get("max_points")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let cutoff = cutoff_for_window(window).ok_or(StatusCode::BAD_REQUEST)?;
    let series = store::series_since(&ctx.pool, target_id, &metric, cutoff)
        .await
        .map_err(internal)?;

    let (points, downsampled) = maybe_downsample(series, max_points);
    Ok(Json(HistoryResponse {
        target_id,
        metric,
        points,
        downsampled,
    }))
}

#[derive(serde::Serialize)]
struct CommandResponse {
    updated: bool,
}

async fn post_acknowledge_alert(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<Json<CommandResponse>, StatusCode> {
    let outcome = ctx.alerts.acknowledge(id).await.map_err(internal)?;
    command_response(outcome)
}

async fn post_resolve_alert(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<Json<CommandResponse>, StatusCode> {
    let outcome = ctx.alerts.resolve(id).await.map_err(internal)?;
    command_response(outcome)
}

async fn post_apply_recommendation(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<Json<CommandResponse>, StatusCode> {
    let outcome = store::apply_recommendation(&ctx.pool, id, Utc::now())
        .await
        .map_err(internal)?;
    command_response(outcome)
}

fn command_response(outcome: CommandOutcome) -> Result<Json<CommandResponse>, StatusCode> {
    match outcome {
        CommandOutcome::Applied => Ok(Json(CommandResponse { updated: true })),
        CommandOutcome::NoOp => Ok(Json(CommandResponse { updated: false })),
        CommandOutcome::NotFound => Err(StatusCode::NOT_FOUND),
    }
}

fn limit_param(params: &HashMap<String, String>, default: i64) -> i64 {
    params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
        .clamp(1, 1_000)
}

fn internal(err: anyhow::Error) -> StatusCode {
    warn!(error = ?err, "api query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn cutoff_for_window(window: &str) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    match window {
        "1h" => Some(now - chrono::Duration::hours(1)),
        "6h" => Some(now - chrono::Duration::hours(6)),
        "24h" => Some(now - chrono::Duration::hours(24)),
        _ => None,
    }
}

pub fn maybe_downsample(points: Vec<SamplePoint>, max_points: usize) -> (Vec<SamplePoint>, bool) {
    if points.len() <= max_points || max_points == 0 {
        return (points, false);
    }
    let step = (points.len() as f64 / max_points as f64).ceil() as usize;
    if step <= 1 {
        return (points, false);
    }
    let mut sampled = Vec::with_capacity(max_points);
    for (idx, point) in points.into_iter().enumerate() {
        if idx % step == 0 {
            sampled.push(point);
        }
    }
    (sampled, true)
}
