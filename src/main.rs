mod alerts;
mod anomaly;
mod app;
mod collector;
mod config;
mod db;
mod evaluate;
mod http;
mod metrics;
mod model;
mod pipeline;
mod recommend;
mod state;
mod store;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertManager;
use crate::anomaly::AnomalyDetector;
use crate::app::AppContext;
use crate::db::EnvCredentials;

#[derive(Debug, Parser)]
#[command(author, version, about = "pgfleet — PostgreSQL fleet monitoring core")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env PGFLEET_CONFIG or built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = metrics::AppMetrics::new()?;
    let state = state::SharedState::new();
    let pool = db::create_store_pool(&config).await?;
    store::ensure_schema(&pool).await?;

    let detector = AnomalyDetector::new(config.anomaly.clone());
    let alerts = AlertManager::new(pool.clone());
    let ctx = AppContext::new(
        config,
        pool,
        metrics,
        state,
        alerts,
        detector,
        Arc::new(EnvCredentials),
    );

    let pipeline_handles = pipeline::spawn_all(ctx.clone());
    let router = http::create_router(ctx.clone());

    info!("pgfleet listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    shutdown_pipeline(pipeline_handles).await;
    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pgfleet=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

async fn shutdown_pipeline(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}
