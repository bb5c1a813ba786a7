use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::{Result, Version, Versioned, store::VersionedStore};

/// PostgreSQL-backed state store.
///
/// Records live in the `kv_records` table. Creation uses
/// `INSERT ... ON CONFLICT DO NOTHING`; updates are conditioned on the stored
/// version, so the database row lock is the only serialization point.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

#[async_trait]
impl VersionedStore for PostgresStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let row = sqlx::query("SELECT value, version FROM kv_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("value")?;
                let version: i64 = row.try_get("version")?;
                Ok(Some(Versioned::new(value, Version::new(version))))
            }
            None => Ok(None),
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Version,
    ) -> Result<bool> {
        let next = expected.next();

        let result = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO kv_records (key, value, version, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(&value)
            .bind(next.as_i64())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE kv_records
                SET value = $2, version = $3, updated_at = $4
                WHERE key = $1 AND version = $5
                "#,
            )
            .bind(key)
            .bind(&value)
            .bind(next.as_i64())
            .bind(Utc::now())
            .bind(expected.as_i64())
            .execute(&self.pool)
            .await?
        };

        let accepted = result.rows_affected() == 1;
        if !accepted {
            metrics::counter!("state_store_cas_conflicts_total").increment(1);
            tracing::debug!(key, %expected, "rejected stale write");
        }
        Ok(accepted)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar(
            "SELECT key FROM kv_records WHERE starts_with(key, $1) ORDER BY key ASC",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }
}
