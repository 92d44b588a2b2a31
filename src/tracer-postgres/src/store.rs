use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, error, info, warn};

use tracer_common::{ReverseIndexRow, TableCatalog, TraceRow, TraceStore};
use tracer_config::PostgresConfig;

const MAX_CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// PostgreSQL backend writing into day-partitioned tables.
pub struct PgTraceStore {
    pool: PgPool,
}

impl PgTraceStore {
    /// Connect to PostgreSQL, retrying a few times before giving up.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!("Connecting trace store to PostgreSQL");

        let mut retry_count = 0;
        let pool = loop {
            match PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(1)
                .acquire_timeout(config.acquire_timeout())
                .connect(&config.url)
                .await
            {
                Ok(pool) => {
                    info!("Successfully connected to PostgreSQL");
                    break pool;
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= MAX_CONNECT_RETRIES {
                        error!(
                            "Failed to connect to PostgreSQL after {} attempts: {}",
                            MAX_CONNECT_RETRIES, e
                        );
                        return Err(anyhow::anyhow!(
                            "Failed to create PostgreSQL connection pool: {}",
                            e
                        ));
                    }
                    warn!(
                        "Failed to connect to PostgreSQL (attempt {}/{}): {}. Retrying in {}s...",
                        retry_count,
                        MAX_CONNECT_RETRIES,
                        e,
                        CONNECT_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        };

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TraceStore for PgTraceStore {
    async fn insert_trace_and_reverse_index(
        &self,
        trace: &TraceRow,
        reverse: &ReverseIndexRow,
    ) -> Result<()> {
        check_table_name(&trace.table_name)?;
        check_table_name(&reverse.table_name)?;

        let mut tx = self.pool.begin().await?;

        let insert_trace = format!(
            "INSERT INTO {} (trace_id, context_id) VALUES ($1, $2)",
            trace.table_name
        );
        sqlx::query(&insert_trace)
            .bind(&trace.trace_id)
            .bind(&trace.context_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert into {}", trace.table_name))?;

        let insert_reverse = format!(
            "INSERT INTO {} (context_id, trace_id) VALUES ($1, $2)",
            reverse.table_name
        );
        sqlx::query(&insert_reverse)
            .bind(&reverse.context_id)
            .bind(&reverse.trace_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert into {}", reverse.table_name))?;

        tx.commit().await?;

        debug!(
            "Inserted trace {} into {} and {}",
            trace.trace_id, trace.table_name, reverse.table_name
        );
        Ok(())
    }
}

#[async_trait]
impl TableCatalog for PgTraceStore {
    async fn create_trace_table(&self, table_name: &str) -> Result<()> {
        check_table_name(table_name)?;
        sqlx::raw_sql(&trace_table_ddl(table_name))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create table {}", table_name))?;
        Ok(())
    }

    async fn create_reverse_index_table(&self, table_name: &str) -> Result<()> {
        check_table_name(table_name)?;
        sqlx::raw_sql(&reverse_index_table_ddl(table_name))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create table {}", table_name))?;
        Ok(())
    }
}

fn trace_table_ddl(table_name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL PRIMARY KEY,
            trace_id TEXT NOT NULL,
            context_id TEXT NOT NULL,
            created_at TIMESTAMPTZ DEFAULT NOW()
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_trace_id ON {table}(trace_id);
        "#,
        table = table_name
    )
}

fn reverse_index_table_ddl(table_name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL PRIMARY KEY,
            context_id TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            created_at TIMESTAMPTZ DEFAULT NOW()
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_context_id ON {table}(context_id);
        "#,
        table = table_name
    )
}

/// Table names are spliced into SQL, so only `<lowercase prefix><8 digits>` passes.
static TABLE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_]+[0-9]{8}$").expect("valid table name pattern"));

fn check_table_name(table_name: &str) -> Result<()> {
    if TABLE_NAME_PATTERN.is_match(table_name) {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Refusing to use invalid table name '{}'", table_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_table_name_accepts_partition_names() {
        assert!(check_table_name("trace_20170521").is_ok());
        assert!(check_table_name("reverse_index_20170521").is_ok());
    }

    #[test]
    fn test_check_table_name_rejects_injection() {
        assert!(check_table_name("trace_20170521; DROP TABLE x").is_err());
        assert!(check_table_name("trace_2017052").is_err());
        assert!(check_table_name("20170521").is_err());
        assert!(check_table_name("Trace_20170521").is_err());
        assert!(check_table_name("").is_err());
        assert!(check_table_name("tracé_20170521").is_err());
        assert!(check_table_name("trace_201705210").is_err());
        assert!(check_table_name("trace_20170521\n").is_err());
    }

    #[test]
    fn test_trace_ddl_indexes_trace_id() {
        let ddl = trace_table_ddl("trace_20170521");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS trace_20170521"));
        assert!(ddl.contains("idx_trace_20170521_trace_id ON trace_20170521(trace_id)"));
    }

    #[test]
    fn test_ddl_does_not_bound_id_length() {
        for ddl in [
            trace_table_ddl("trace_20170521"),
            reverse_index_table_ddl("reverse_index_20170521"),
        ] {
            assert!(ddl.contains("trace_id TEXT NOT NULL"));
            assert!(ddl.contains("context_id TEXT NOT NULL"));
            assert!(!ddl.contains("VARCHAR"));
        }
    }

    #[test]
    fn test_reverse_index_ddl_indexes_context_id() {
        let ddl = reverse_index_table_ddl("reverse_index_20170521");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS reverse_index_20170521"));
        assert!(ddl.contains("ON reverse_index_20170521(context_id)"));
    }
}
