//! Advisory rules over windowed history: cache efficiency, recurring slow
//! statements, connection pressure, resource growth trends, deadlock
//! churn. Generators are pure; the ml loop feeds them aggregates read
//! from the store and upserts whatever they emit.

use serde_json::json;

use crate::config::RecommendationConfig;
use crate::model::{Priority, QueryStat, RecommendationCategory, RecommendationDraft, SamplePoint};

/// Aggregates for one target over the rule windows. A `None` or empty
/// field means the store had no data and the dependent rules skip.
#[derive(Debug, Default, Clone)]
pub struct TargetWindow {
    pub mean_cache_hit_ratio: Option<f64>,
    pub mean_connection_utilization: Option<f64>,
    pub cpu_series: Vec<SamplePoint>,
    pub memory_series: Vec<SamplePoint>,
    /// First and last deadlocks_count value inside the trend window.
    pub deadlock_bounds: Option<(f64, f64)>,
    pub query_stats: Vec<QueryStat>,
}

/// Evaluate every rule for one target, highest priority first.
pub fn generate_recommendations(
    target_id: i64,
    window: &TargetWindow,
    cfg: &RecommendationConfig,
) -> Vec<RecommendationDraft> {
    let mut drafts = Vec::new();

    drafts.extend(low_cache_hit_ratio(target_id, window, cfg));
    drafts.extend(slow_queries(target_id, window, cfg));
    drafts.extend(connection_pressure(target_id, window, cfg));
    drafts.extend(growth_trend(
        target_id,
        &window.cpu_series,
        "cpu_growth_trend",
        "CPU usage",
        cfg.cpu_trend_per_hour,
        cfg,
    ));
    drafts.extend(growth_trend(
        target_id,
        &window.memory_series,
        "memory_growth_trend",
        "Memory usage",
        cfg.memory_trend_per_hour,
        cfg,
    ));
    drafts.extend(deadlock_activity(target_id, window, cfg));

    drafts.sort_by(|a, b| b.priority.cmp(&a.priority));
    drafts
}

fn low_cache_hit_ratio(
    target_id: i64,
    window: &TargetWindow,
    cfg: &RecommendationConfig,
) -> Option<RecommendationDraft> {
    let mean = window.mean_cache_hit_ratio?;
    if mean >= cfg.min_cache_hit_ratio {
        return None;
    }

    let priority = if mean < cfg.poor_cache_hit_ratio {
        Priority::High
    } else {
        Priority::Medium
    };

    Some(RecommendationDraft {
        target_id,
        category: RecommendationCategory::Configuration,
        rule: "low_cache_hit_ratio".to_string(),
        priority,
        title: "Cache hit ratio below target".to_string(),
        description: format!(
            "Mean cache hit ratio over the sampling window is {:.1}% (target {:.1}%). Reads are spilling to disk instead of being served from shared buffers.",
            mean, cfg.min_cache_hit_ratio
        ),
        suggested_action: "Increase shared_buffers and verify effective_cache_size reflects available memory, then re-check the ratio after a warm-up period.".to_string(),
        impact_estimate: Some(
            "Fewer disk reads on the hot path and lower average query latency".to_string(),
        ),
        metadata: json!({
            "mean_cache_hit_ratio": mean,
            "minimum": cfg.min_cache_hit_ratio,
        }),
    })
}

fn slow_queries(
    target_id: i64,
    window: &TargetWindow,
    cfg: &RecommendationConfig,
) -> Option<RecommendationDraft> {
    let offenders: Vec<&QueryStat> = window
        .query_stats
        .iter()
        .filter(|stat| stat.calls >= cfg.min_calls && stat.mean_time_ms > cfg.slow_query_ms)
        .collect();
    if offenders.is_empty() {
        return None;
    }

    let worst = offenders
        .iter()
        .max_by(|a, b| a.mean_time_ms.total_cmp(&b.mean_time_ms))?;

    Some(RecommendationDraft {
        target_id,
        category: RecommendationCategory::QueryOptimization,
        rule: "slow_queries".to_string(),
        priority: Priority::High,
        title: "Recurring slow statements".to_string(),
        description: format!(
            "{} statements with at least {} calls average above {:.0} ms. The slowest (queryid {}) averages {:.0} ms over {} calls.",
            offenders.len(),
            cfg.min_calls,
            cfg.slow_query_ms,
            worst.query_id,
            worst.mean_time_ms,
            worst.calls
        ),
        suggested_action:
            "Run EXPLAIN ANALYZE on the listed statements; add the missing indexes or rewrite the hottest predicates.".to_string(),
        impact_estimate: Some(format!(
            "Up to {:.0} ms saved per call on the slowest statement",
            worst.mean_time_ms
        )),
        metadata: json!({
            "slow_query_ms": cfg.slow_query_ms,
            "min_calls": cfg.min_calls,
            "offenders": offenders
                .iter()
                .take(5)
                .map(|stat| json!({
                    "query_id": stat.query_id,
                    "calls": stat.calls,
                    "mean_time_ms": stat.mean_time_ms,
                }))
                .collect::<Vec<_>>(),
        }),
    })
}

fn connection_pressure(
    target_id: i64,
    window: &TargetWindow,
    cfg: &RecommendationConfig,
) -> Option<RecommendationDraft> {
    let mean = window.mean_connection_utilization?;
    if mean <= cfg.connection_pressure_warn {
        return None;
    }

    let priority = if mean > cfg.connection_pressure_high {
        Priority::High
    } else {
        Priority::Medium
    };

    Some(RecommendationDraft {
        target_id,
        category: RecommendationCategory::CapacityPlanning,
        rule: "connection_pressure".to_string(),
        priority,
        title: "Connection slots under pressure".to_string(),
        description: format!(
            "Mean connection utilization over the sampling window is {:.1}% of max_connections.",
            mean
        ),
        suggested_action:
            "Put a pooler (pgbouncer) in front of the target or raise max_connections; audit clients holding idle sessions.".to_string(),
        impact_estimate: Some("Headroom for connection spikes without refused sessions".to_string()),
        metadata: json!({
            "mean_connection_utilization": mean,
            "warn_above": cfg.connection_pressure_warn,
            "high_above": cfg.connection_pressure_high,
        }),
    })
}

fn growth_trend(
    target_id: i64,
    series: &[SamplePoint],
    rule: &str,
    display: &str,
    limit_per_hour: f64,
    cfg: &RecommendationConfig,
) -> Option<RecommendationDraft> {
    if series.len() < cfg.trend_min_points {
        return None;
    }
    let slope = slope_per_hour(series)?;
    if slope <= limit_per_hour {
        return None;
    }

    Some(RecommendationDraft {
        target_id,
        category: RecommendationCategory::CapacityPlanning,
        rule: rule.to_string(),
        priority: Priority::Medium,
        title: format!("{display} trending upward"),
        description: format!(
            "{display} is growing {slope:.1}% per hour across {} samples in the trend window.",
            series.len()
        ),
        suggested_action: format!(
            "Identify the workload driving the {} growth and plan capacity before saturation.",
            display.to_lowercase()
        ),
        impact_estimate: None,
        metadata: json!({
            "slope_per_hour": slope,
            "points": series.len(),
            "limit_per_hour": limit_per_hour,
        }),
    })
}

fn deadlock_activity(
    target_id: i64,
    window: &TargetWindow,
    cfg: &RecommendationConfig,
) -> Option<RecommendationDraft> {
    let (first, last) = window.deadlock_bounds?;
    let increase = last - first;
    // deadlocks_count is cumulative; a stats reset shows up as a drop and
    // must not fire.
    if increase <= 0.0 {
        return None;
    }

    let priority = if increase > cfg.deadlock_high_increase {
        Priority::High
    } else {
        Priority::Medium
    };

    Some(RecommendationDraft {
        target_id,
        category: RecommendationCategory::Maintenance,
        rule: "deadlock_activity".to_string(),
        priority,
        title: "Deadlocks detected".to_string(),
        description: format!(
            "Deadlocks increased by {increase:.0} across the trend window (from {first:.0} to {last:.0})."
        ),
        suggested_action:
            "Review transaction ordering on the busiest tables; consistent lock ordering and shorter transactions remove most deadlock cycles.".to_string(),
        impact_estimate: Some("Fewer aborted transactions and client retries".to_string()),
        metadata: json!({
            "window_start_count": first,
            "window_end_count": last,
            "increase": increase,
        }),
    })
}

/// Least-squares slope in value units per hour over timestamped points.
/// Returns `None` when the series is too short or has no time spread.
fn slope_per_hour(points: &[SamplePoint]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }

    let t0 = points[0].ts;
    let xs: Vec<f64> = points
        .iter()
        .map(|p| p.ts.signed_duration_since(t0).num_seconds() as f64 / 3600.0)
        .collect();

    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = points.iter().map(|p| p.value).sum();
    let sum_xy: f64 = xs.iter().zip(points).map(|(x, p)| x * p.value).sum();
    let sum_x2: f64 = xs.iter().map(|x| x * x).sum();

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return None;
    }
    Some((n * sum_xy - sum_x * sum_y) / denominator)
}
