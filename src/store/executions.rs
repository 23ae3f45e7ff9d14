/// Execution run repository
///
/// The orchestrator persists its run after every applied change through this
/// contract; status queries read from it.

use crate::workflow::types::ExecutionRun;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

/// Persistence contract for execution runs
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert or replace the full run record
    async fn save_run(&self, run: &ExecutionRun) -> Result<()>;

    async fn get_run(&self, execution_id: &str) -> Result<Option<ExecutionRun>>;

    /// Most recent runs for a workflow, newest first
    async fn list_runs(&self, workflow_id: &str, limit: i64) -> Result<Vec<ExecutionRun>>;
}

#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionStore {
    async fn save_run(&self, run: &ExecutionRun) -> Result<()> {
        let run_json = serde_json::to_string(run)?;
        let status = serde_json::to_value(run.status)?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, status, run, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                run = excluded.run,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(status.as_str().unwrap_or("pending"))
        .bind(&run_json)
        .bind(run.created_at.to_rfc3339())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, execution_id: &str) -> Result<Option<ExecutionRun>> {
        let row = sqlx::query("SELECT run FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let run_json: String = row.get("run");
                Ok(Some(serde_json::from_str(&run_json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, workflow_id: &str, limit: i64) -> Result<Vec<ExecutionRun>> {
        let rows = sqlx::query(
            "SELECT run FROM executions WHERE workflow_id = ? ORDER BY created_at DESC LIMIT ?"
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ExecutionRun> {
                let run_json: String = row.get("run");
                Ok(serde_json::from_str(&run_json)?)
            })
            .collect()
    }
}
