/// Append-only audit log of sandboxed executions
///
/// One row per transform execution attempt, including refusals. Rows are never
/// updated or deleted by the engine.

use crate::sandbox::Violation;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    /// Static analysis refused to run the code
    Refused,
}

impl AuditOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Refused => "refused",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "success" => AuditOutcome::Success,
            "refused" => AuditOutcome::Refused,
            _ => AuditOutcome::Failure,
        }
    }
}

/// A new audit row, before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub workflow_id: String,
    pub node_id: String,
    pub user_id: Option<String>,
    pub execution_id: Option<String>,
    pub outcome: AuditOutcome,
    /// Sanitized error message, never source code
    pub error: Option<String>,
    pub violations: Vec<Violation>,
    pub duration_ms: u64,
}

/// A stored audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: AuditRecord,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one record; returns the new row id
    pub async fn record(&self, record: &AuditRecord) -> Result<i64> {
        let violations = serde_json::to_string(&record.violations)?;
        let result = sqlx::query(
            r#"
            INSERT INTO sandbox_audit
                (workflow_id, node_id, user_id, execution_id, outcome, error, violations, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.workflow_id)
        .bind(&record.node_id)
        .bind(&record.user_id)
        .bind(&record.execution_id)
        .bind(record.outcome.as_str())
        .bind(&record.error)
        .bind(&violations)
        .bind(record.duration_ms as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::debug!("📝 Audit: {} {}/{} ({} violation(s))",
            record.outcome.as_str(), record.workflow_id, record.node_id, record.violations.len());

        Ok(result.last_insert_rowid())
    }

    /// Newest entries first
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, node_id, user_id, execution_id, outcome, error, violations, duration_ms, created_at
            FROM sandbox_audit ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn recent_for_workflow(&self, workflow_id: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, node_id, user_id, execution_id, outcome, error, violations, duration_ms, created_at
            FROM sandbox_audit WHERE workflow_id = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let violations: String = row.get("violations");
    let outcome: String = row.get("outcome");
    let duration_ms: i64 = row.get("duration_ms");
    let created_at: String = row.get("created_at");

    Ok(AuditEntry {
        id: row.get("id"),
        record: AuditRecord {
            workflow_id: row.get("workflow_id"),
            node_id: row.get("node_id"),
            user_id: row.get("user_id"),
            execution_id: row.get("execution_id"),
            outcome: AuditOutcome::parse(&outcome),
            error: row.get("error"),
            violations: serde_json::from_str(&violations)?,
            duration_ms: duration_ms.max(0) as u64,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::analyzer;
    use crate::store::Database;

    fn record(workflow_id: &str, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord {
            workflow_id: workflow_id.to_string(),
            node_id: "t1".to_string(),
            user_id: Some("u-1".to_string()),
            execution_id: None,
            outcome,
            error: None,
            violations: Vec::new(),
            duration_ms: 3,
        }
    }

    #[tokio::test]
    async fn records_are_appended_and_listed_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let audit = AuditLog::new(db.pool().clone());

        let mut refused = record("wf-a", AuditOutcome::Refused);
        refused.violations = analyzer::analyze("os.execute('ls')");
        refused.error = Some("process: line 1".to_string());

        let first = audit.record(&record("wf-a", AuditOutcome::Success)).await.unwrap();
        let second = audit.record(&refused).await.unwrap();
        audit.record(&record("wf-b", AuditOutcome::Failure)).await.unwrap();
        assert!(second > first);

        let all = audit.recent(10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].record.workflow_id, "wf-b");

        let for_a = audit.recent_for_workflow("wf-a", 10).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].record.outcome, AuditOutcome::Refused);
        assert_eq!(for_a[0].record.violations, refused.violations);
        assert_eq!(for_a[1].record.outcome, AuditOutcome::Success);
    }
}
