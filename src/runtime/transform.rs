/// Transform node: user-authored Lua run inside the sandbox
///
/// Config: `{ "code": "...", "timeout_ms"?: 500, "memory_limit_mb"?: 32 }`.
/// The node input is exposed as `input`, workflow variables as `vars`, and the
/// chunk's return value becomes the node output. Every attempt, including
/// refusals, is written to the sandbox audit log.

use crate::error::{EngineError, TimeoutScope};
use crate::runtime::executor::{NodeContext, NodeExecutor, NodeOutcome};
use crate::sandbox::{
    AuditLog, AuditOutcome, AuditRecord, Sandbox, SandboxContext, SandboxErrorKind, SandboxExecutionResult,
    SandboxLimits,
};
use crate::workflow::types::Node;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct TransformExecutor {
    sandbox: Arc<dyn Sandbox>,
    audit: Option<AuditLog>,
}

impl TransformExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>, audit: Option<AuditLog>) -> Self {
        Self { sandbox, audit }
    }

    /// Sandbox defaults, tightened or relaxed per node
    fn limits_for(&self, node: &Node) -> SandboxLimits {
        let defaults = self.sandbox.default_limits();
        SandboxLimits {
            timeout_ms: node.config_u64("timeout_ms").unwrap_or(defaults.timeout_ms),
            memory_limit_mb: node
                .config_u64("memory_limit_mb")
                .map(|mb| mb as usize)
                .unwrap_or(defaults.memory_limit_mb),
        }
    }

    /// Audit row for this node, completed once the sandbox result is known
    fn audit_template(node: &Node, ctx: &NodeContext) -> AuditRecord {
        AuditRecord {
            workflow_id: ctx.workflow_id.clone(),
            node_id: node.id.clone(),
            user_id: ctx.user_id.clone(),
            execution_id: Some(ctx.execution_id.clone()).filter(|id| !id.is_empty()),
            outcome: AuditOutcome::Failure,
            error: None,
            violations: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Run the sandbox and write the audit row on a detached task
    ///
    /// The node future may be dropped by a node timeout, an abort or a cancel;
    /// the spawned task still finishes the sandbox call and records it.
    async fn run_audited(
        &self,
        node: &Node,
        ctx: &NodeContext,
        code: &str,
        context: SandboxContext,
        limits: SandboxLimits,
    ) -> Result<SandboxExecutionResult, EngineError> {
        let sandbox = Arc::clone(&self.sandbox);
        let audit = self.audit.clone();
        let template = Self::audit_template(node, ctx);
        let code = code.to_string();

        let task = tokio::spawn(async move {
            let result = sandbox.execute(&code, context, limits).await;
            if let Some(audit) = audit {
                let record = complete_record(template, &result);
                if let Err(e) = audit.record(&record).await {
                    tracing::error!("❌ Failed to write sandbox audit entry for '{}': {}", record.node_id, e);
                }
            }
            result
        });

        task.await.map_err(|e| {
            tracing::error!("❌ Sandbox task for '{}' ended abnormally: {}", node.id, e);
            EngineError::node(&node.id, "sandbox task failed")
        })
    }
}

fn complete_record(mut record: AuditRecord, result: &SandboxExecutionResult) -> AuditRecord {
    record.outcome = if result.success {
        AuditOutcome::Success
    } else if result.was_refused() {
        AuditOutcome::Refused
    } else {
        AuditOutcome::Failure
    };
    record.error = result.error.as_ref().map(|e| e.message.clone());
    record.violations = result.security_violations.clone();
    record.duration_ms = result.execution_time_ms;
    record
}

#[async_trait]
impl NodeExecutor for TransformExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        let code = node
            .config_str("code")
            .ok_or_else(|| EngineError::node(&node.id, "transform is missing 'code'"))?;
        let limits = self.limits_for(node);

        tracing::debug!("🔧 Executing transform '{}' ({}ms, {}MB)", node.id, limits.timeout_ms, limits.memory_limit_mb);

        let context = SandboxContext {
            input,
            variables: ctx.variables.clone(),
        };
        let result = self.run_audited(node, ctx, code, context, limits).await?;

        if result.success {
            return Ok(NodeOutcome::output(result.output.unwrap_or(Value::Null)));
        }

        let Some(error) = result.error else {
            return Err(EngineError::node(&node.id, "sandbox reported failure without an error"));
        };
        Err(match error.kind {
            SandboxErrorKind::SecurityViolation => EngineError::SecurityViolation {
                category: result
                    .security_violations
                    .iter()
                    .find(|v| v.is_critical())
                    .map(|v| v.category.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                reason: error.message,
            },
            SandboxErrorKind::MemoryLimit => EngineError::SecurityViolation {
                category: "resource".to_string(),
                reason: error.message,
            },
            SandboxErrorKind::Timeout => EngineError::Timeout {
                scope: TimeoutScope::Sandbox,
                timeout_ms: limits.timeout_ms,
            },
            SandboxErrorKind::SyntaxError => EngineError::node(&node.id, format!("syntax error: {}", error.message)),
            SandboxErrorKind::RuntimeError
            | SandboxErrorKind::InvalidOutput
            | SandboxErrorKind::Internal => EngineError::node(&node.id, error.message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LuaSandbox;
    use crate::store::Database;
    use crate::workflow::types::NodeType;
    use serde_json::json;
    use std::time::Duration;

    fn ctx() -> NodeContext {
        NodeContext {
            execution_id: "exec-1".into(),
            workflow_id: "wf-1".into(),
            user_id: Some("u-7".into()),
            variables: json!({ "factor": 3 }),
            ..NodeContext::default()
        }
    }

    #[tokio::test]
    async fn successful_transform_is_audited() {
        let db = Database::in_memory().await.unwrap();
        let audit = AuditLog::new(db.pool().clone());
        let executor = TransformExecutor::new(Arc::new(LuaSandbox::default()), Some(audit.clone()));
        let node = Node::new("t1", NodeType::Transform, json!({ "code": "return { result = input.x * vars.factor }" }));

        let outcome = executor.execute(&node, json!({ "x": 4 }), &ctx()).await.unwrap();
        assert_eq!(outcome.output, json!({ "result": 12 }));

        let entries = audit.recent(5).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.outcome, AuditOutcome::Success);
        assert_eq!(entries[0].record.user_id.as_deref(), Some("u-7"));
        assert_eq!(entries[0].record.execution_id.as_deref(), Some("exec-1"));
    }

    #[tokio::test]
    async fn refused_code_surfaces_a_security_violation() {
        let db = Database::in_memory().await.unwrap();
        let audit = AuditLog::new(db.pool().clone());
        let executor = TransformExecutor::new(Arc::new(LuaSandbox::default()), Some(audit.clone()));
        let node = Node::new("t1", NodeType::Transform, json!({ "code": "return io.open('/etc/hosts'):read('*a')" }));

        let err = executor.execute(&node, json!({}), &ctx()).await.unwrap_err();
        match err {
            EngineError::SecurityViolation { category, reason } => {
                assert_eq!(category, "filesystem");
                assert!(!reason.contains("/etc/hosts"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let entries = audit.recent_for_workflow("wf-1", 5).await.unwrap();
        assert_eq!(entries[0].record.outcome, AuditOutcome::Refused);
        assert!(entries[0].record.violations.iter().any(|v| v.is_critical()));
    }

    #[tokio::test]
    async fn dropped_transform_is_still_audited() {
        let db = Database::in_memory().await.unwrap();
        let audit = AuditLog::new(db.pool().clone());
        let executor = TransformExecutor::new(Arc::new(LuaSandbox::default()), Some(audit.clone()));
        let node = Node::new("spin", NodeType::Transform, json!({ "code": "while true do end", "timeout_ms": 300 }));

        // The caller gives up long before the sandbox deadline
        let cut_short = tokio::time::timeout(Duration::from_millis(50), executor.execute(&node, json!({}), &ctx())).await;
        assert!(cut_short.is_err());

        let mut entries = Vec::new();
        for _ in 0..100 {
            entries = audit.recent_for_workflow("wf-1", 5).await.unwrap();
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.node_id, "spin");
        assert_eq!(entries[0].record.outcome, AuditOutcome::Failure);
        assert_eq!(entries[0].record.execution_id.as_deref(), Some("exec-1"));
    }

    #[tokio::test]
    async fn node_limits_override_sandbox_defaults() {
        let executor = TransformExecutor::new(Arc::new(LuaSandbox::default()), None);
        let node = Node::new("spin", NodeType::Transform, json!({ "code": "while true do end", "timeout_ms": 100 }));

        let err = executor.execute(&node, json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout { scope: TimeoutScope::Sandbox, timeout_ms: 100 });
    }
}
