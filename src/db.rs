use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::info;

use crate::config::{AppConfig, CollectorConfig};
use crate::model::MonitoredTarget;

pub type DbPool = PgPool;

/// Build the connection pool for the fleet metadata store.
pub async fn create_store_pool(config: &AppConfig) -> Result<DbPool> {
    let connect_options = PgConnectOptions::from_str(&config.store.dsn)
        .context("invalid store DSN supplied")?
        .application_name("pgfleet")
        .options([
            (
                "statement_timeout",
                config.store.statement_timeout_ms.to_string(),
            ),
            ("lock_timeout", config.store.lock_timeout_ms.to_string()),
        ]);

    let pool = PgPoolOptions::new()
        .max_connections(config.store.max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(connect_options)
        .await
        .context("failed to connect to the fleet store")?;

    info!(fleet = %config.fleet, "connected to fleet store");
    Ok(pool)
}

/// Resolves a target's `credential_ref` into a live password. The reference
/// is an opaque name; implementations decide where the secret lives. The
/// resolved value is handed straight to the connector and never stored.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, credential_ref: &str) -> Result<String>;
}

/// Default provider: `credential_ref` names an environment variable.
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn resolve(&self, credential_ref: &str) -> Result<String> {
        if credential_ref.trim().is_empty() {
            bail!("target has an empty credential_ref");
        }
        match env::var(credential_ref) {
            Ok(secret) if !secret.is_empty() => Ok(secret),
            Ok(_) => bail!("credential variable {credential_ref} is set but empty"),
            Err(_) => bail!("credential variable {credential_ref} is not set"),
        }
    }
}

/// Connect options for one collection session against a monitored target.
/// Sessions are read-only by construction; collection must never write to
/// a target.
pub fn target_connect_options(
    target: &MonitoredTarget,
    password: &str,
    collector: &CollectorConfig,
) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&target.host)
        .port(target.port)
        .database(&target.database)
        .username(&target.username)
        .password(password)
        .application_name("pgfleet-collector")
        .options([
            (
                "statement_timeout",
                collector.statement_timeout_ms.to_string(),
            ),
            ("lock_timeout", collector.lock_timeout_ms.to_string()),
            ("default_transaction_read_only", "on".to_string()),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_credentials_reject_missing_and_empty() {
        let provider = EnvCredentials;
        assert!(provider.resolve("").is_err());
        assert!(provider.resolve("PGFLEET_TEST_NO_SUCH_VAR").is_err());

        std::env::set_var("PGFLEET_TEST_CRED", "s3cret");
        assert_eq!(
            provider.resolve("PGFLEET_TEST_CRED").ok().as_deref(),
            Some("s3cret")
        );
        std::env::remove_var("PGFLEET_TEST_CRED");
    }
}
