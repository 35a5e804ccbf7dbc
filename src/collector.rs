//! One collection cycle against one monitored target: connect, gather the
//! fixed metric set, and hand back a batch sharing a single timestamp.
//! A metric whose backing view or extension is absent is omitted; the
//! cycle continues. Only a dead connection fails the whole cycle.

use std::time::Duration;

use chrono::Utc;
use sqlx::error::DatabaseError;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::CollectorConfig;
use crate::db;
use crate::model::{MetricBatch, MonitoredTarget, QueryStat, metric};

#[derive(Debug, Error)]
pub enum CollectError {
    /// Could not open a connection; zero samples exist for this cycle.
    #[error("target unreachable: {0}")]
    Unreachable(#[source] sqlx::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// A metric query failed for a reason other than a missing view,
    /// column, or function. The connection is suspect; the cycle fails.
    #[error("metric query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Everything gathered from one target in one cycle.
#[derive(Debug)]
pub struct Collection {
    pub batch: MetricBatch,
    pub query_stats: Vec<QueryStat>,
}

#[instrument(skip_all, fields(target_id = target.id))]
pub async fn collect(
    target: &MonitoredTarget,
    password: &str,
    cfg: &CollectorConfig,
) -> Result<Collection, CollectError> {
    let options = db::target_connect_options(target, password, cfg);
    let mut conn =
        match tokio::time::timeout(cfg.connect_timeout, PgConnection::connect_with(&options)).await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(CollectError::Unreachable(err)),
            Err(_) => return Err(CollectError::ConnectTimeout(cfg.connect_timeout)),
        };

    let collected_at = Utc::now();
    let mut batch = MetricBatch::new(target.id, collected_at);

    gather_connections(&mut conn, &mut batch).await?;
    gather_database_stats(&mut conn, &mut batch).await?;
    gather_buffer_cache(&mut conn, &mut batch).await?;
    gather_statement_summary(&mut conn, &mut batch, cfg).await?;
    gather_locks(&mut conn, &mut batch).await?;
    gather_system_usage(&mut conn, &mut batch).await?;
    let query_stats = gather_query_stats(&mut conn, target.id, collected_at, cfg).await?;

    let _ = conn.close().await;
    Ok(Collection { batch, query_stats })
}

async fn gather_connections(
    conn: &mut PgConnection,
    batch: &mut MetricBatch,
) -> Result<(), CollectError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*)::bigint AS total,
               COUNT(*) FILTER (WHERE state = 'active')::bigint AS active,
               COUNT(*) FILTER (WHERE state = 'idle')::bigint AS idle,
               current_setting('max_connections')::float8 AS max_connections
        FROM pg_stat_activity
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;

    let total: i64 = row.try_get("total")?;
    let active: i64 = row.try_get("active")?;
    let idle: i64 = row.try_get("idle")?;
    let max_connections: f64 = row.try_get("max_connections")?;

    batch.push(metric::ACTIVE_CONNECTIONS, active as f64, "connections");
    batch.push(metric::IDLE_CONNECTIONS, idle as f64, "connections");
    batch.push(metric::MAX_CONNECTIONS, max_connections, "connections");
    if let Some(utilization) = percent_of(total as f64, max_connections) {
        batch.push(metric::CONNECTION_UTILIZATION, utilization, "percent");
    }
    Ok(())
}

/// Cache hit ratio, deadlocks, block reads, temp spill, and database size
/// all come from one pg_stat_database row for the connected database.
async fn gather_database_stats(
    conn: &mut PgConnection,
    batch: &mut MetricBatch,
) -> Result<(), CollectError> {
    let row = sqlx::query(
        r#"
        SELECT CASE WHEN blks_hit + blks_read > 0
                    THEN blks_hit::float8 / (blks_hit + blks_read) * 100.0
               END AS cache_hit_ratio,
               deadlocks::float8 AS deadlocks,
               blks_read::float8 AS blks_read,
               temp_bytes::float8 AS temp_bytes,
               pg_database_size(current_database())::float8 AS database_size
        FROM pg_stat_database
        WHERE datname = current_database()
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;

    if let Some(ratio) = row.try_get::<Option<f64>, _>("cache_hit_ratio")? {
        batch.push(metric::CACHE_HIT_RATIO, ratio, "percent");
    }
    batch.push(
        metric::DEADLOCKS_COUNT,
        row.try_get::<f64, _>("deadlocks")?,
        "count",
    );
    batch.push(
        metric::DISK_READS,
        row.try_get::<f64, _>("blks_read")?,
        "blocks",
    );
    batch.push(
        metric::TEMP_BYTES,
        row.try_get::<f64, _>("temp_bytes")?,
        "bytes",
    );
    batch.push(
        metric::DATABASE_SIZE_BYTES,
        row.try_get::<f64, _>("database_size")?,
        "bytes",
    );
    Ok(())
}

async fn gather_buffer_cache(
    conn: &mut PgConnection,
    batch: &mut MetricBatch,
) -> Result<(), CollectError> {
    let row = sqlx::query(
        r#"
        SELECT CASE WHEN SUM(heap_blks_hit) + SUM(heap_blks_read) > 0
                    THEN SUM(heap_blks_hit)::float8
                         / (SUM(heap_blks_hit) + SUM(heap_blks_read)) * 100.0
               END AS buffer_hit_ratio
        FROM pg_statio_user_tables
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;

    if let Some(ratio) = row.try_get::<Option<f64>, _>("buffer_hit_ratio")? {
        batch.push(metric::BUFFER_CACHE_HIT_RATIO, ratio, "percent");
    }
    Ok(())
}

/// Mean statement time and slow-statement count from pg_stat_statements.
/// Missing extension or pre-13 column names just omit the metrics.
async fn gather_statement_summary(
    conn: &mut PgConnection,
    batch: &mut MetricBatch,
    cfg: &CollectorConfig,
) -> Result<(), CollectError> {
    let result = sqlx::query(
        r#"
        SELECT AVG(mean_exec_time) AS avg_time_ms,
               COUNT(*) FILTER (WHERE mean_exec_time > $1)::float8 AS slow_count
        FROM pg_stat_statements
        "#,
    )
    .bind(cfg.slow_query_ms)
    .fetch_one(&mut *conn)
    .await;

    let row = match result {
        Ok(row) => row,
        Err(err) if is_metric_unavailable(&err) => {
            debug!("pg_stat_statements unavailable; statement metrics omitted");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(avg) = row.try_get::<Option<f64>, _>("avg_time_ms")? {
        batch.push(metric::AVG_QUERY_TIME_MS, avg, "ms");
    }
    batch.push(
        metric::SLOW_QUERIES_COUNT,
        row.try_get::<f64, _>("slow_count")?,
        "count",
    );
    Ok(())
}

async fn gather_locks(
    conn: &mut PgConnection,
    batch: &mut MetricBatch,
) -> Result<(), CollectError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) FILTER (WHERE granted)::bigint AS granted,
               COUNT(*) FILTER (WHERE NOT granted)::bigint AS waiting
        FROM pg_locks
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;

    let granted: i64 = row.try_get("granted")?;
    let waiting: i64 = row.try_get("waiting")?;
    batch.push(metric::LOCKS_COUNT, granted as f64, "locks");
    batch.push(metric::WAITING_LOCKS, waiting as f64, "locks");
    Ok(())
}

/// Host CPU/memory/disk via the system_stats extension. Most targets do
/// not have it installed; each probe degrades independently.
async fn gather_system_usage(
    conn: &mut PgConnection,
    batch: &mut MetricBatch,
) -> Result<(), CollectError> {
    let cpu = sqlx::query("SELECT 100.0 - idle_mode_percent AS cpu_usage FROM pg_sys_cpu_usage_info()")
        .fetch_one(&mut *conn)
        .await;
    match cpu {
        Ok(row) => {
            if let Some(usage) = row.try_get::<Option<f64>, _>("cpu_usage")? {
                batch.push(metric::CPU_USAGE, usage, "percent");
            }
        }
        Err(err) if is_metric_unavailable(&err) => {
            debug!("system_stats cpu probe unavailable");
        }
        Err(err) => return Err(err.into()),
    }

    let memory = sqlx::query(
        r#"
        SELECT CASE WHEN total_memory > 0
                    THEN used_memory::float8 / total_memory * 100.0
               END AS memory_usage
        FROM pg_sys_memory_info()
        "#,
    )
    .fetch_one(&mut *conn)
    .await;
    match memory {
        Ok(row) => {
            if let Some(usage) = row.try_get::<Option<f64>, _>("memory_usage")? {
                batch.push(metric::MEMORY_USAGE, usage, "percent");
            }
        }
        Err(err) if is_metric_unavailable(&err) => {
            debug!("system_stats memory probe unavailable");
        }
        Err(err) => return Err(err.into()),
    }

    let disk = sqlx::query(
        r#"
        SELECT CASE WHEN SUM(total_space) > 0
                    THEN SUM(used_space)::float8 / SUM(total_space) * 100.0
               END AS disk_usage
        FROM pg_sys_disk_info()
        "#,
    )
    .fetch_one(&mut *conn)
    .await;
    match disk {
        Ok(row) => {
            if let Some(usage) = row.try_get::<Option<f64>, _>("disk_usage")? {
                batch.push(metric::DISK_USAGE, usage, "percent");
            }
        }
        Err(err) if is_metric_unavailable(&err) => {
            debug!("system_stats disk probe unavailable");
        }
        Err(err) => return Err(err.into()),
    }

    Ok(())
}

/// Top statements by total execution time, for the recommendation engine.
async fn gather_query_stats(
    conn: &mut PgConnection,
    target_id: i64,
    collected_at: chrono::DateTime<Utc>,
    cfg: &CollectorConfig,
) -> Result<Vec<QueryStat>, CollectError> {
    let result = sqlx::query(
        r#"
        SELECT s.queryid AS query_id,
               s.calls,
               s.mean_exec_time AS mean_time_ms,
               s.total_exec_time AS total_time_ms,
               s.rows AS rows_returned
        FROM pg_stat_statements s
        WHERE s.queryid IS NOT NULL
        ORDER BY s.total_exec_time DESC
        LIMIT $1
        "#,
    )
    .bind(cfg.top_queries)
    .fetch_all(&mut *conn)
    .await;

    let rows = match result {
        Ok(rows) => rows,
        Err(err) if is_metric_unavailable(&err) => {
            warn!("pg_stat_statements unavailable; statement capture disabled for this target");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let mut stats = Vec::with_capacity(rows.len());
    for row in &rows {
        let mean_time_ms: f64 = row.try_get("mean_time_ms")?;
        stats.push(QueryStat {
            target_id,
            query_id: row.try_get("query_id")?,
            calls: row.try_get("calls")?,
            mean_time_ms,
            total_time_ms: row.try_get("total_time_ms")?,
            rows: row.try_get("rows_returned")?,
            performance_category: QueryStat::categorize(mean_time_ms),
            collected_at,
        });
    }
    Ok(stats)
}

/// Missing relation, type, column, or function: the degradable class.
/// Everything else means the session itself is in trouble.
fn is_metric_unavailable(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            is_missing_relation(db_err.as_ref())
                || is_missing_column(db_err.as_ref())
                || is_missing_function(db_err.as_ref())
        }
        _ => false,
    }
}

fn is_missing_relation(error: &dyn DatabaseError) -> bool {
    if let Some(code) = error.code() {
        code == "42P01" || code == "42704"
    } else {
        false
    }
}

fn is_missing_column(error: &dyn DatabaseError) -> bool {
    if let Some(code) = error.code() {
        code == "42703"
    } else {
        false
    }
}

fn is_missing_function(error: &dyn DatabaseError) -> bool {
    if let Some(code) = error.code() {
        code == "42883"
    } else {
        false
    }
}

fn percent_of(part: f64, whole: f64) -> Option<f64> {
    if whole > 0.0 {
        Some(part / whole * 100.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_guards_division() {
        assert_eq!(percent_of(50.0, 100.0), Some(50.0));
        assert_eq!(percent_of(10.0, 0.0), None);
        assert_eq!(percent_of(0.0, 200.0), Some(0.0));
    }

    #[test]
    fn connect_errors_have_distinct_shapes() {
        let timeout = CollectError::ConnectTimeout(Duration::from_secs(10));
        assert!(timeout.to_string().contains("timed out"));
        let unreachable = CollectError::Unreachable(sqlx::Error::PoolClosed);
        assert!(unreachable.to_string().starts_with("target unreachable"));
    }
}
