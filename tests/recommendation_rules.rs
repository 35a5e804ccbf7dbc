use chrono::{Duration, TimeZone, Utc};
use pgfleet::config::RecommendationConfig;
use pgfleet::model::{Priority, QueryStat, RecommendationCategory, SamplePoint};
use pgfleet::recommend::{generate_recommendations, TargetWindow};

fn sampled_series(start_slope_per_hour: f64, points: usize) -> Vec<SamplePoint> {
    // One point every 30 minutes starting from a fixed origin.
    let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    (0..points)
        .map(|i| SamplePoint {
            ts: start + Duration::minutes(30 * i as i64),
            value: 40.0 + start_slope_per_hour * (i as f64 / 2.0),
        })
        .collect()
}

fn query_stat(query_id: i64, calls: i64, mean_time_ms: f64) -> QueryStat {
    QueryStat {
        target_id: 7,
        query_id,
        calls,
        mean_time_ms,
        total_time_ms: mean_time_ms * calls as f64,
        rows: calls * 3,
        performance_category: QueryStat::categorize(mean_time_ms),
        collected_at: Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap(),
    }
}

#[test]
fn struggling_target_emits_full_rule_sweep() {
    let cfg = RecommendationConfig::default();

    // One target showing every pathology at once: cold cache, two recurring
    // slow statements, near-exhausted connection slots, memory climbing
    // 3%/hour, and eight new deadlocks inside the trend window.
    let window = TargetWindow {
        mean_cache_hit_ratio: Some(75.0),
        mean_connection_utilization: Some(95.0),
        cpu_series: sampled_series(0.0, 12),
        memory_series: sampled_series(3.0, 12),
        deadlock_bounds: Some((2.0, 10.0)),
        query_stats: vec![
            query_stat(101, 40, 2_400.0),
            query_stat(102, 15, 1_200.0),
            query_stat(103, 500, 4.0), // fast, stays out of the evidence
        ],
    };

    let drafts = generate_recommendations(7, &window, &cfg);

    let rules: Vec<&str> = drafts.iter().map(|d| d.rule.as_str()).collect();
    assert_eq!(
        rules.len(),
        5,
        "expected one draft per firing rule, got {rules:?}"
    );
    assert!(rules.contains(&"low_cache_hit_ratio"));
    assert!(rules.contains(&"slow_queries"));
    assert!(rules.contains(&"connection_pressure"));
    assert!(rules.contains(&"memory_growth_trend"));
    assert!(rules.contains(&"deadlock_activity"));
    assert!(
        !rules.contains(&"cpu_growth_trend"),
        "flat CPU series must not flag a trend"
    );

    // Output is sorted high priority first; the only medium draft (the
    // memory trend) comes last.
    assert!(drafts.windows(2).all(|w| w[0].priority >= w[1].priority));
    assert_eq!(drafts.last().unwrap().rule, "memory_growth_trend");
    assert_eq!(drafts.last().unwrap().priority, Priority::Medium);

    for draft in &drafts {
        assert_eq!(draft.target_id, 7);
        assert!(!draft.title.is_empty());
        assert!(!draft.suggested_action.is_empty());
    }

    // Each rule carries its category for the open-rule uniqueness key.
    let by_rule = |rule: &str| {
        drafts
            .iter()
            .find(|d| d.rule == rule)
            .unwrap_or_else(|| panic!("missing draft for {rule}"))
    };
    assert_eq!(
        by_rule("low_cache_hit_ratio").category,
        RecommendationCategory::Configuration
    );
    assert_eq!(
        by_rule("slow_queries").category,
        RecommendationCategory::QueryOptimization
    );
    assert_eq!(
        by_rule("connection_pressure").category,
        RecommendationCategory::CapacityPlanning
    );
    assert_eq!(
        by_rule("deadlock_activity").category,
        RecommendationCategory::Maintenance
    );

    // Slow-query evidence names the worst statement and skips the fast one.
    let slow = by_rule("slow_queries");
    assert!(slow.description.contains("queryid 101"));
    let offenders = slow.metadata["offenders"].as_array().expect("offenders");
    assert_eq!(offenders.len(), 2, "fast statement must not appear");
}

#[test]
fn healthy_target_stays_quiet() {
    let cfg = RecommendationConfig::default();

    let window = TargetWindow {
        mean_cache_hit_ratio: Some(99.2),
        mean_connection_utilization: Some(35.0),
        cpu_series: sampled_series(0.0, 12),
        memory_series: sampled_series(0.0, 12),
        deadlock_bounds: Some((7.0, 7.0)),
        query_stats: vec![query_stat(200, 10_000, 2.5)],
    };

    let drafts = generate_recommendations(3, &window, &cfg);
    assert!(
        drafts.is_empty(),
        "healthy window produced {} drafts",
        drafts.len()
    );
}

#[test]
fn growth_limits_differ_per_resource() {
    let cfg = RecommendationConfig::default();

    // The same 1.5%/hour climb sits between the memory limit (1%/hour)
    // and the CPU limit (2%/hour), so only the memory rule fires.
    let climb = sampled_series(1.5, 12);
    let window = TargetWindow {
        cpu_series: climb.clone(),
        memory_series: climb,
        ..TargetWindow::default()
    };

    let drafts = generate_recommendations(4, &window, &cfg);
    assert_eq!(drafts.len(), 1, "expected only the memory trend to fire");
    assert_eq!(drafts[0].rule, "memory_growth_trend");
    assert_eq!(drafts[0].category, RecommendationCategory::CapacityPlanning);
}
