//! Key-value table backing the engine's durable store.

use super::Pool;
use aquapin_engine::{Error, KeyValueStore, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use std::sync::Arc;

/// [`KeyValueStore`] over the `kv_store` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn new_shared(pool: Pool) -> Arc<Self> {
        Arc::new(Self::new(pool))
    }

    /// Every stored key, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::store)?;

        rows.iter()
            .map(|row| row.try_get("key").map_err(Error::store))
            .collect()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::store)?;

        row.map(|r| r.try_get("value").map_err(Error::store))
            .transpose()
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::store)?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(Error::store)?;

        Ok(())
    }
}
