use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/pgfleet.yaml";

/// Top-level configuration for the pgfleet core.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Human-readable name for this fleet deployment (logs + overview).
    #[serde(default = "AppConfig::default_fleet")]
    pub fleet: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub recommendations: RecommendationConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl AppConfig {
    fn default_fleet() -> String {
        "local".to_string()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fleet: Self::default_fleet(),
            store: StoreConfig::default(),
            http: HttpConfig::default(),
            scheduler: SchedulerConfig::default(),
            pools: PoolsConfig::default(),
            collector: CollectorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            anomaly: AnomalyConfig::default(),
            recommendations: RecommendationConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Fleet metadata store (the core's own Postgres database).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Always empty in YAML; populated from PGFLEET_STORE_DSN.
    #[serde(default)]
    pub dsn: String,
    #[serde(default = "StoreConfig::default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "StoreConfig::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "StoreConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Budget for retrying transient write failures before the cycle gives up.
    #[serde(
        default = "StoreConfig::default_retry_budget",
        with = "humantime_serde"
    )]
    pub retry_budget: Duration,
}

impl StoreConfig {
    const fn default_max_connections() -> u32 {
        10
    }

    const fn default_statement_timeout_ms() -> u64 {
        5_000
    }

    const fn default_lock_timeout_ms() -> u64 {
        1_000
    }

    const fn default_retry_budget() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            max_connections: Self::default_max_connections(),
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            retry_budget: Self::default_retry_budget(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8191".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

/// Loop cadences plus the adaptive-interval policy applied per target.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Due-queue sweep cadence.
    #[serde(default = "SchedulerConfig::default_tick", with = "humantime_serde")]
    pub tick: Duration,
    /// Baseline (re)training sweep.
    #[serde(
        default = "SchedulerConfig::default_training_interval",
        with = "humantime_serde"
    )]
    pub training_interval: Duration,
    /// Recommendation rule sweep.
    #[serde(
        default = "SchedulerConfig::default_recommendation_interval",
        with = "humantime_serde"
    )]
    pub recommendation_interval: Duration,
    /// Retention purge sweep.
    #[serde(
        default = "SchedulerConfig::default_retention_interval",
        with = "humantime_serde"
    )]
    pub retention_interval: Duration,
    /// Lower clamp for any per-target interval, configured or adapted.
    #[serde(
        default = "SchedulerConfig::default_min_interval",
        with = "humantime_serde"
    )]
    pub min_interval: Duration,
    /// Upper clamp for any per-target interval.
    #[serde(
        default = "SchedulerConfig::default_max_interval",
        with = "humantime_serde"
    )]
    pub max_interval: Duration,
    /// Alert-free cycles required before the interval is allowed to grow.
    #[serde(default = "SchedulerConfig::default_relax_after")]
    pub relax_after: u32,
    /// Growth applied once the relax streak is reached.
    #[serde(
        default = "SchedulerConfig::default_growth_step",
        with = "humantime_serde"
    )]
    pub growth_step: Duration,
    /// Consecutive cycle failures before a connection alert opens.
    #[serde(default = "SchedulerConfig::default_failures_before_alert")]
    pub failures_before_alert: u32,
    /// Consecutive cycle failures before that alert escalates to critical.
    #[serde(default = "SchedulerConfig::default_failures_before_critical")]
    pub failures_before_critical: u32,
}

impl SchedulerConfig {
    const fn default_tick() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_training_interval() -> Duration {
        Duration::from_secs(3_600)
    }

    const fn default_recommendation_interval() -> Duration {
        Duration::from_secs(900)
    }

    const fn default_retention_interval() -> Duration {
        Duration::from_secs(86_400)
    }

    const fn default_min_interval() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_max_interval() -> Duration {
        Duration::from_secs(300)
    }

    const fn default_relax_after() -> u32 {
        3
    }

    const fn default_growth_step() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_failures_before_alert() -> u32 {
        3
    }

    const fn default_failures_before_critical() -> u32 {
        5
    }

    /// Clamp an interval into the configured [min, max] band.
    pub fn clamp_interval(&self, interval: Duration) -> Duration {
        interval.max(self.min_interval).min(self.max_interval)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Self::default_tick(),
            training_interval: Self::default_training_interval(),
            recommendation_interval: Self::default_recommendation_interval(),
            retention_interval: Self::default_retention_interval(),
            min_interval: Self::default_min_interval(),
            max_interval: Self::default_max_interval(),
            relax_after: Self::default_relax_after(),
            growth_step: Self::default_growth_step(),
            failures_before_alert: Self::default_failures_before_alert(),
            failures_before_critical: Self::default_failures_before_critical(),
        }
    }
}

/// Worker-pool sizing and runaway-task limits.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolsConfig {
    #[serde(default = "PoolsConfig::default_monitoring_permits")]
    pub monitoring_permits: usize,
    #[serde(
        default = "PoolsConfig::default_monitoring_soft_limit",
        with = "humantime_serde"
    )]
    pub monitoring_soft_limit: Duration,
    #[serde(
        default = "PoolsConfig::default_monitoring_hard_limit",
        with = "humantime_serde"
    )]
    pub monitoring_hard_limit: Duration,
    #[serde(default = "PoolsConfig::default_ml_permits")]
    pub ml_permits: usize,
    #[serde(
        default = "PoolsConfig::default_ml_soft_limit",
        with = "humantime_serde"
    )]
    pub ml_soft_limit: Duration,
    #[serde(
        default = "PoolsConfig::default_ml_hard_limit",
        with = "humantime_serde"
    )]
    pub ml_hard_limit: Duration,
}

impl PoolsConfig {
    const fn default_monitoring_permits() -> usize {
        4
    }

    const fn default_monitoring_soft_limit() -> Duration {
        Duration::from_secs(240)
    }

    const fn default_monitoring_hard_limit() -> Duration {
        Duration::from_secs(300)
    }

    const fn default_ml_permits() -> usize {
        2
    }

    const fn default_ml_soft_limit() -> Duration {
        Duration::from_secs(540)
    }

    const fn default_ml_hard_limit() -> Duration {
        Duration::from_secs(600)
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            monitoring_permits: Self::default_monitoring_permits(),
            monitoring_soft_limit: Self::default_monitoring_soft_limit(),
            monitoring_hard_limit: Self::default_monitoring_hard_limit(),
            ml_permits: Self::default_ml_permits(),
            ml_soft_limit: Self::default_ml_soft_limit(),
            ml_hard_limit: Self::default_ml_hard_limit(),
        }
    }
}

/// Per-target collection session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(
        default = "CollectorConfig::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "CollectorConfig::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "CollectorConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Statements with a mean above this count as slow.
    #[serde(default = "CollectorConfig::default_slow_query_ms")]
    pub slow_query_ms: f64,
    /// Top-N statements captured per cycle, by total execution time.
    #[serde(default = "CollectorConfig::default_top_queries")]
    pub top_queries: i64,
}

impl CollectorConfig {
    const fn default_connect_timeout() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_statement_timeout_ms() -> u64 {
        3_000
    }

    const fn default_lock_timeout_ms() -> u64 {
        1_000
    }

    const fn default_slow_query_ms() -> f64 {
        1_000.0
    }

    const fn default_top_queries() -> i64 {
        20
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            slow_query_ms: Self::default_slow_query_ms(),
            top_queries: Self::default_top_queries(),
        }
    }
}

/// Severity escalation for threshold breaches. The breach ratio is
/// value/threshold for high-is-bad metrics and threshold/value for
/// low-is-bad ones.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "EvaluatorConfig::default_critical_ratio")]
    pub critical_ratio: f64,
    #[serde(default = "EvaluatorConfig::default_high_ratio")]
    pub high_ratio: f64,
}

impl EvaluatorConfig {
    const fn default_critical_ratio() -> f64 {
        1.5
    }

    const fn default_high_ratio() -> f64 {
        1.2
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            critical_ratio: Self::default_critical_ratio(),
            high_ratio: Self::default_high_ratio(),
        }
    }
}

/// Baseline training and z-score detection knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Rolling window the baseline trains over, in samples.
    #[serde(default = "AnomalyConfig::default_window")]
    pub window: usize,
    /// Minimum samples before a baseline may score anything.
    #[serde(default = "AnomalyConfig::default_min_train")]
    pub min_train: usize,
    #[serde(default = "AnomalyConfig::default_z_cutoff")]
    pub z_cutoff: f64,
    /// Retrain when fresh samples exceed this fraction of the training size.
    #[serde(default = "AnomalyConfig::default_retrain_fraction")]
    pub retrain_fraction: f64,
    #[serde(default = "AnomalyConfig::default_model_ttl", with = "humantime_serde")]
    pub model_ttl: Duration,
}

impl AnomalyConfig {
    const fn default_window() -> usize {
        500
    }

    const fn default_min_train() -> usize {
        50
    }

    const fn default_z_cutoff() -> f64 {
        3.0
    }

    const fn default_retrain_fraction() -> f64 {
        0.8
    }

    const fn default_model_ttl() -> Duration {
        Duration::from_secs(3_600)
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: Self::default_window(),
            min_train: Self::default_min_train(),
            z_cutoff: Self::default_z_cutoff(),
            retrain_fraction: Self::default_retrain_fraction(),
            model_ttl: Self::default_model_ttl(),
        }
    }
}

/// Recommendation rule thresholds and evidence windows.
#[derive(Debug, Clone, Deserialize)]
pub struct RecommendationConfig {
    /// Mean cache hit ratio below this fires the configuration rule.
    #[serde(default = "RecommendationConfig::default_min_cache_hit_ratio")]
    pub min_cache_hit_ratio: f64,
    /// Below this the cache rule escalates to high priority.
    #[serde(default = "RecommendationConfig::default_poor_cache_hit_ratio")]
    pub poor_cache_hit_ratio: f64,
    #[serde(default = "RecommendationConfig::default_slow_query_ms")]
    pub slow_query_ms: f64,
    /// Statements below this call count are ignored by the slow-query rule.
    #[serde(default = "RecommendationConfig::default_min_calls")]
    pub min_calls: i64,
    #[serde(default = "RecommendationConfig::default_connection_pressure_warn")]
    pub connection_pressure_warn: f64,
    #[serde(default = "RecommendationConfig::default_connection_pressure_high")]
    pub connection_pressure_high: f64,
    /// CPU growth slope (percent per hour) that flags a capacity trend.
    #[serde(default = "RecommendationConfig::default_cpu_trend_per_hour")]
    pub cpu_trend_per_hour: f64,
    /// Memory growth slope (percent per hour) that flags a capacity trend.
    #[serde(default = "RecommendationConfig::default_memory_trend_per_hour")]
    pub memory_trend_per_hour: f64,
    /// Minimum points before a trend slope is trusted.
    #[serde(default = "RecommendationConfig::default_trend_min_points")]
    pub trend_min_points: usize,
    /// Deadlock increase beyond this escalates the maintenance rule.
    #[serde(default = "RecommendationConfig::default_deadlock_high_increase")]
    pub deadlock_high_increase: f64,
    /// Evidence window for utilization-style rules.
    #[serde(
        default = "RecommendationConfig::default_utilization_window",
        with = "humantime_serde"
    )]
    pub utilization_window: Duration,
    /// Evidence window for growth-trend rules.
    #[serde(
        default = "RecommendationConfig::default_trend_window",
        with = "humantime_serde"
    )]
    pub trend_window: Duration,
}

impl RecommendationConfig {
    const fn default_min_cache_hit_ratio() -> f64 {
        90.0
    }

    const fn default_poor_cache_hit_ratio() -> f64 {
        80.0
    }

    const fn default_slow_query_ms() -> f64 {
        1_000.0
    }

    const fn default_min_calls() -> i64 {
        10
    }

    const fn default_connection_pressure_warn() -> f64 {
        80.0
    }

    const fn default_connection_pressure_high() -> f64 {
        90.0
    }

    const fn default_cpu_trend_per_hour() -> f64 {
        2.0
    }

    const fn default_memory_trend_per_hour() -> f64 {
        1.0
    }

    const fn default_trend_min_points() -> usize {
        10
    }

    const fn default_deadlock_high_increase() -> f64 {
        5.0
    }

    const fn default_utilization_window() -> Duration {
        Duration::from_secs(3_600)
    }

    const fn default_trend_window() -> Duration {
        Duration::from_secs(86_400)
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            min_cache_hit_ratio: Self::default_min_cache_hit_ratio(),
            poor_cache_hit_ratio: Self::default_poor_cache_hit_ratio(),
            slow_query_ms: Self::default_slow_query_ms(),
            min_calls: Self::default_min_calls(),
            connection_pressure_warn: Self::default_connection_pressure_warn(),
            connection_pressure_high: Self::default_connection_pressure_high(),
            cpu_trend_per_hour: Self::default_cpu_trend_per_hour(),
            memory_trend_per_hour: Self::default_memory_trend_per_hour(),
            trend_min_points: Self::default_trend_min_points(),
            deadlock_high_increase: Self::default_deadlock_high_increase(),
            utilization_window: Self::default_utilization_window(),
            trend_window: Self::default_trend_window(),
        }
    }
}

/// History pruning horizon. Active alerts and unapplied recommendations
/// are never purged regardless of age.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_retention_days")]
    pub retention_days: u32,
}

impl RetentionConfig {
    const fn default_retention_days() -> u32 {
        90
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: Self::default_retention_days(),
        }
    }
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("PGFLEET_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    ensure_required_secrets(&config)?;
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.store.dsn.trim().is_empty() {
        bail!(
            "Remove `store.dsn` from pgfleet YAML config; set the store connection string via the PGFLEET_STORE_DSN environment variable (see .env.sample)."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(fleet) = env::var("PGFLEET_FLEET") {
        if !fleet.is_empty() {
            config.fleet = fleet;
        }
    }

    match env::var("PGFLEET_STORE_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!(
                    "Environment variable PGFLEET_STORE_DSN is set but empty; populate it in your .env file."
                );
            }
            config.store.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    Ok(())
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.store.dsn.trim().is_empty() {
        bail!(
            "Missing store DSN. Set the PGFLEET_STORE_DSN environment variable (see .env.sample). Secrets must not be stored in YAML."
        );
    }
    Ok(())
}

fn validate(config: &AppConfig) -> Result<()> {
    let sched = &config.scheduler;
    if sched.min_interval > sched.max_interval {
        bail!(
            "scheduler.min_interval ({:?}) exceeds scheduler.max_interval ({:?})",
            sched.min_interval,
            sched.max_interval
        );
    }
    let pools = &config.pools;
    if pools.monitoring_soft_limit > pools.monitoring_hard_limit
        || pools.ml_soft_limit > pools.ml_hard_limit
    {
        bail!("pool soft limits must not exceed their hard limits");
    }
    if pools.monitoring_permits == 0 || pools.ml_permits == 0 {
        bail!("pool permit counts must be at least 1");
    }
    if config.anomaly.min_train == 0 || config.anomaly.window < config.anomaly.min_train {
        bail!(
            "anomaly.window ({}) must be at least anomaly.min_train ({}, non-zero)",
            config.anomaly.window,
            config.anomaly.min_train
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_dsn_is_rejected() {
        let mut config = AppConfig::default();
        config.store.dsn = "postgres://user:pw@host/db".into();
        assert!(enforce_yaml_policy(&config).is_err());

        config.store.dsn.clear();
        assert!(enforce_yaml_policy(&config).is_ok());
    }

    #[test]
    fn missing_dsn_fails_startup() {
        let config = AppConfig::default();
        assert!(ensure_required_secrets(&config).is_err());
    }

    #[test]
    fn interval_clamp_respects_band() {
        let sched = SchedulerConfig::default();
        assert_eq!(
            sched.clamp_interval(Duration::from_secs(5)),
            Duration::from_secs(30)
        );
        assert_eq!(
            sched.clamp_interval(Duration::from_secs(3_600)),
            Duration::from_secs(300)
        );
        assert_eq!(
            sched.clamp_interval(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn inverted_limits_fail_validation() {
        let mut config = AppConfig::default();
        config.store.dsn = "postgres://ok".into();
        config.scheduler.min_interval = Duration::from_secs(600);
        assert!(validate(&config).is_err());

        let mut config = AppConfig::default();
        config.store.dsn = "postgres://ok".into();
        config.anomaly.window = 10;
        assert!(validate(&config).is_err());
    }
}
