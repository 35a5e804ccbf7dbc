use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::alerts::AlertManager;
use crate::anomaly::AnomalyDetector;
use crate::config::{AppConfig, PoolsConfig};
use crate::db::{CredentialProvider, DbPool};
use crate::metrics::AppMetrics;
use crate::state::SharedState;

/// The two bounded worker pools. Monitoring work (collect, evaluate,
/// alert) must never wait behind ml work (training, recommendations).
#[derive(Clone)]
pub struct WorkerPools {
    pub monitoring: Arc<Semaphore>,
    pub ml: Arc<Semaphore>,
}

impl WorkerPools {
    pub fn from_config(config: &PoolsConfig) -> Self {
        Self {
            monitoring: Arc::new(Semaphore::new(config.monitoring_permits)),
            ml: Arc::new(Semaphore::new(config.ml_permits)),
        }
    }
}

/// Shared application context passed to HTTP handlers and pipeline loops.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub pool: DbPool,
    pub metrics: AppMetrics,
    pub state: SharedState,
    pub alerts: Arc<AlertManager>,
    pub detector: Arc<AnomalyDetector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub pools: WorkerPools,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        pool: DbPool,
        metrics: AppMetrics,
        state: SharedState,
        alerts: AlertManager,
        detector: AnomalyDetector,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let pools = WorkerPools::from_config(&config.pools);
        Self {
            config: Arc::new(config),
            pool,
            metrics,
            state,
            alerts: Arc::new(alerts),
            detector: Arc::new(detector),
            credentials,
            pools,
        }
    }

    pub fn fleet_name(&self) -> &str {
        &self.config.fleet
    }
}
