//! Module data repository for persistent key-value storage.
//!
//! Every entry is keyed by `(module, key)`. The module half of the key is
//! always supplied by the host, so a script can only reach its own rows.

use chrono::Utc;

use crate::db::DbPool;
use crate::error::Result;

/// Repository for module data operations.
pub struct ModuleDataRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> ModuleDataRepository<'a> {
    /// Create a new module data repository.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a value. Missing keys and stored nulls both yield `None`.
    pub async fn get(&self, module: &str, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM module_data WHERE module = $1 AND key = $2")
                .bind(module)
                .bind(key)
                .fetch_optional(self.pool)
                .await?;

        Ok(value.flatten())
    }

    /// Insert or replace a value.
    pub async fn set(&self, module: &str, key: &str, value: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO module_data (module, key, value, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(module, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(module)
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// List all keys stored for a module.
    pub async fn keys(&self, module: &str) -> Result<Vec<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM module_data WHERE module = $1 ORDER BY key")
                .bind(module)
                .fetch_all(self.pool)
                .await?;

        Ok(keys)
    }
}
