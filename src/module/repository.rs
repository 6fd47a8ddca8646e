//! Module repository for database operations.

use chrono::{DateTime, Utc};

use crate::db::DbPool;
use crate::Result;

/// A persisted module row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredModule {
    /// Module name.
    pub name: String,
    /// Lua source.
    pub code: String,
    /// Time of the last successful install.
    pub updated_at: DateTime<Utc>,
}

/// Repository for module source persistence.
pub struct ModuleRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> ModuleRepository<'a> {
    /// Create a new ModuleRepository with the given pool reference.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a module by name.
    pub async fn get(&self, name: &str) -> Result<Option<StoredModule>> {
        let module = sqlx::query_as::<_, StoredModule>(
            "SELECT name, code, updated_at FROM modules WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.pool)
        .await?;

        Ok(module)
    }

    /// Insert or replace a module's source.
    pub async fn upsert(&self, name: &str, code: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO modules (name, code, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT(name) DO UPDATE SET
                code = excluded.code,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(code)
        .bind(Utc::now())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// List every persisted module, ordered by name.
    pub async fn list_all(&self) -> Result<Vec<StoredModule>> {
        let modules = sqlx::query_as::<_, StoredModule>(
            "SELECT name, code, updated_at FROM modules ORDER BY name",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(modules)
    }
}
