//! Module command execution log repository.

use chrono::{DateTime, Duration, Utc};

use crate::db::DbPool;
use crate::error::Result;

/// A single command execution log entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModuleExecution {
    /// Unique identifier.
    pub id: i64,
    /// Module name.
    pub module: String,
    /// Command name (without the `command_` prefix).
    pub command: String,
    /// Requesting user.
    pub user_id: i64,
    /// Execution timestamp.
    pub executed_at: DateTime<Utc>,
    /// Execution time in milliseconds.
    pub execution_ms: i64,
    /// Whether execution was successful.
    pub success: bool,
    /// Error message if execution failed.
    pub error_message: Option<String>,
}

/// New execution log entry for insertion.
#[derive(Debug, Clone)]
pub struct NewModuleExecution<'a> {
    pub module: &'a str,
    pub command: &'a str,
    pub user_id: i64,
    pub execution_ms: i64,
    pub error_message: Option<&'a str>,
}

/// Repository for command execution logs.
pub struct ModuleExecutionRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> ModuleExecutionRepository<'a> {
    /// Create a new execution log repository.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Record one execution. Success is implied by the absence of an error.
    pub async fn record(&self, entry: &NewModuleExecution<'_>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO module_executions
                (module, command, user_id, executed_at, execution_ms, success, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(entry.module)
        .bind(entry.command)
        .bind(entry.user_id)
        .bind(Utc::now())
        .bind(entry.execution_ms)
        .bind(entry.error_message.is_none())
        .bind(entry.error_message)
        .fetch_one(self.pool)
        .await?;

        Ok(id)
    }

    /// Get the most recent executions of a module, newest first.
    pub async fn recent(&self, module: &str, limit: usize) -> Result<Vec<ModuleExecution>> {
        let logs = sqlx::query_as::<_, ModuleExecution>(
            r#"
            SELECT id, module, command, user_id, executed_at, execution_ms, success, error_message
            FROM module_executions
            WHERE module = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(module)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;

        Ok(logs)
    }

    /// Get success rate for a module (as percentage 0-100).
    pub async fn success_rate(&self, module: &str) -> Result<Option<f64>> {
        let (total, succeeded): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(success) FROM module_executions WHERE module = $1",
        )
        .bind(module)
        .fetch_one(self.pool)
        .await?;

        if total == 0 {
            return Ok(None);
        }

        Ok(Some(succeeded.unwrap_or(0) as f64 / total as f64 * 100.0))
    }

    /// Delete logs older than the given number of days.
    pub async fn delete_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);

        let result = sqlx::query("DELETE FROM module_executions WHERE executed_at < $1")
            .bind(cutoff)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
