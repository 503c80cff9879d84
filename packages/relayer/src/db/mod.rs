//! Postgres-backed key/value store
//!
//! Holds the relayer's checkpoints in a single `kv_store` table so a restart
//! on another host resumes where the last process stopped.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::blockstore::{KeyValueStore, StoreError};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        info!("Postgres checkpoint store ready");
        Ok(Self { pool })
    }
}

fn backend(context: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolClosed => StoreError::Closed,
        other => StoreError::Backend(format!("{}: {}", context, other)),
    }
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(r#"SELECT value FROM kv_store WHERE key = $1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("Failed to read key", e))?;

        Ok(row.map(|r| r.0))
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("Failed to write key", e))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
