//! Postgres-backed query operation.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::Row;
use tracing::{info, trace};

use crate::config::PostgresConfig;
use crate::operation::{OperationFuture, QueryOperation};
use crate::task::Task;

/// Per-minute usage aggregation for one host over a time range.
pub const BENCH_QUERY: &str = r#"
SELECT
       time_bucket('1 minute', ts) AS one_min,
       AVG(usage),
       MIN(usage),
       MAX(usage)
FROM cpu_usage
WHERE host = $1
  AND ts BETWEEN $2 AND $3
GROUP BY one_min
ORDER BY one_min DESC;
"#;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn connect_options(cfg: &PostgresConfig) -> PgConnectOptions {
    let ssl_mode = if cfg.ssl {
        PgSslMode::Require
    } else {
        PgSslMode::Disable
    };

    PgConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .username(&cfg.user)
        .password(&cfg.password)
        .database(&cfg.db)
        .ssl_mode(ssl_mode)
}

/// One decoded row of [`BENCH_QUERY`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageBucket {
    pub bucket: DateTime<Utc>,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl UsageBucket {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        // time_bucket keeps the column type, which may be either flavour.
        let bucket = match row.try_get::<DateTime<Utc>, _>(0) {
            Ok(ts) => ts,
            Err(_) => row.try_get::<NaiveDateTime, _>(0)?.and_utc(),
        };

        Ok(Self {
            bucket,
            avg: row.try_get(1)?,
            min: row.try_get(2)?,
            max: row.try_get(3)?,
        })
    }
}

pub struct PostgresOperation {
    pool: PgPool,
}

impl PostgresOperation {
    /// Open a pool sized for `workers` and check the server answers.
    pub async fn connect(cfg: &PostgresConfig, workers: usize) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(workers as u32)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(connect_options(cfg))
            .await
            .with_context(|| format!("can't open db connection to {}:{}", cfg.host, cfg.port))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("can't ping db")?;

        info!(host = %cfg.host, port = cfg.port, db = %cfg.db, "connected to postgres");

        Ok(Self { pool })
    }

    /// Wrap a pool that connects on first use.
    pub fn lazy(cfg: &PostgresConfig, workers: usize, acquire_timeout: Duration) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(workers as u32)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(connect_options(cfg));
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run(&self, task: &Task) -> Result<Vec<UsageBucket>> {
        let rows = sqlx::query(BENCH_QUERY)
            .bind(task.host.as_str())
            .bind(task.start)
            .bind(task.end)
            .fetch_all(&self.pool)
            .await
            .context("failed to execute query")?;

        let buckets = rows
            .iter()
            .map(UsageBucket::from_row)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to scan row")?;

        trace!(host = %task.host, rows = buckets.len(), "query done");
        Ok(buckets)
    }
}

impl QueryOperation for PostgresOperation {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn execute<'a>(&'a self, task: &'a Task) -> OperationFuture<'a> {
        Box::pin(async move {
            self.run(task).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_config() {
        let cfg = PostgresConfig {
            host: "db.internal".to_string(),
            port: 6543,
            user: "bench".to_string(),
            password: "secret".to_string(),
            db: "homework".to_string(),
            ssl: false,
        };
        let opts = connect_options(&cfg);

        assert_eq!(opts.get_host(), "db.internal");
        assert_eq!(opts.get_port(), 6543);
        assert_eq!(opts.get_username(), "bench");
        assert_eq!(opts.get_database(), Some("homework"));
        assert!(matches!(opts.get_ssl_mode(), PgSslMode::Disable));

        let secure = connect_options(&PostgresConfig {
            ssl: true,
            ..cfg
        });
        assert!(matches!(secure.get_ssl_mode(), PgSslMode::Require));
    }

    #[test]
    fn test_query_takes_host_and_range() {
        for placeholder in ["$1", "$2", "$3"] {
            assert!(BENCH_QUERY.contains(placeholder));
        }
        assert!(!BENCH_QUERY.contains("$4"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_operation_error() {
        let cfg = PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..PostgresConfig::default()
        };
        let op = PostgresOperation::lazy(&cfg, 1, Duration::from_secs(2));
        let now = Utc::now();
        let task = Task {
            host: "host_000001".to_string(),
            start: now,
            end: now,
        };

        assert!(op.execute(&task).await.is_err());
        op.close().await;
    }
}
