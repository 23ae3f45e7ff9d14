/// Trigger dispatch
///
/// Three ways into a run:
/// - webhook: token lookup, secret / IP checks and admission (`webhook.rs`)
/// - schedule: cron firings with admission (`scheduler.rs`)
/// - manual: programmatic runs gated by the `Authorizer` and admission (here)

// Authorization seam for manual runs
pub mod auth;

// Cron trigger service
pub mod scheduler;

// Webhook validation and admission
pub mod webhook;

use crate::error::EngineError;
use crate::ratelimit::{limits_from_node_config, Admission, RateLimiter};
use crate::runtime::ExecutionEngine;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::types::{ExecutionRun, NodeType, RunRequest, TriggerSource, WorkflowStatus};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use auth::{AllowAll, Authorizer, Principal, UserAllowList};
pub use scheduler::CronSchedulerService;
pub use webhook::{WebhookAccepted, WebhookDispatcher, WebhookRejection, WebhookRequest};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("not allowed to run workflow '{0}'")]
    Forbidden(String),

    #[error("workflow '{0}' is disabled")]
    Disabled(String),

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("admission unavailable: {0}")]
    AdmissionUnavailable(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Manual / programmatic run entry point
#[derive(Clone)]
pub struct TriggerDispatcher {
    registry: Arc<WorkflowRegistry>,
    engine: ExecutionEngine,
    authorizer: Arc<dyn Authorizer>,
    limiter: Arc<RateLimiter>,
}

impl TriggerError {
    /// Whole seconds for a `Retry-After` header, at least one
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            TriggerError::RateLimited { retry_after_ms } => Some(retry_after_ms.div_ceil(1000).max(1)),
            _ => None,
        }
    }
}

impl TriggerDispatcher {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        engine: ExecutionEngine,
        authorizer: Arc<dyn Authorizer>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            engine,
            authorizer,
            limiter,
        }
    }

    /// Start a run on behalf of `principal`
    ///
    /// Draft workflows may be run manually; disabled ones may not. When the
    /// workflow has a `ManualTrigger` node the run starts there and the other
    /// triggers are skipped. Admission is keyed per workflow, with windows from
    /// that node's `rate_limit` block or the configured defaults.
    pub async fn run_manual(&self, workflow_id: &str, input: Value, principal: &Principal) -> Result<ExecutionRun, TriggerError> {
        let compiled = self
            .registry
            .get_workflow(workflow_id)
            .ok_or_else(|| TriggerError::NotFound(workflow_id.to_string()))?;
        let workflow = compiled.workflow;

        if workflow.status == WorkflowStatus::Disabled {
            return Err(TriggerError::Disabled(workflow_id.to_string()));
        }
        if !self.authorizer.can_run(principal, &workflow).await {
            tracing::warn!("🔒 Manual run of '{}' refused for {:?}", workflow_id, principal.user_id);
            return Err(TriggerError::Forbidden(workflow_id.to_string()));
        }

        let trigger = workflow.nodes.iter().find(|n| n.node_type == NodeType::ManualTrigger);

        let key = format!("manual:{}", workflow_id);
        let limits = trigger
            .and_then(|node| limits_from_node_config(&node.config))
            .unwrap_or_else(|| self.limiter.default_limits().to_vec());
        match self.limiter.check(&key, &limits).await {
            Ok(Admission::Allowed) => {}
            Ok(Admission::Denied { retry_after_ms, .. }) => {
                return Err(TriggerError::RateLimited { retry_after_ms });
            }
            Err(e) => {
                tracing::error!("❌ Admission check failed for manual run of '{}': {}", workflow_id, e);
                return Err(TriggerError::AdmissionUnavailable(e.to_string()));
            }
        }

        let mut request = match trigger {
            Some(node) => RunRequest::from_trigger(TriggerSource::Manual, node.id.clone(), input),
            None => RunRequest::manual(input),
        };
        request.user_id = principal.user_id.clone();

        tracing::info!("👆 Manual run requested for workflow '{}'", workflow_id);
        Ok(self.engine.run(workflow, request).await?)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::EngineConfig;
    use crate::runtime::external::{ExternalClient, ExternalError, ExternalRequest, ExternalResponse};
    use crate::runtime::{BroadcastPublisher, ExecutionEngine, ExecutorSet};
    use crate::sandbox::LuaSandbox;
    use crate::store::{Database, SqliteExecutionStore, WorkflowStorage};
    use crate::workflow::registry::WorkflowRegistry;
    use crate::workflow::types::{ExecutionRun, RunStatus};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    pub struct NoNetwork;

    #[async_trait]
    impl ExternalClient for NoNetwork {
        async fn send(&self, _request: ExternalRequest) -> Result<ExternalResponse, ExternalError> {
            Err(ExternalError::Permanent("network disabled in tests".into()))
        }
    }

    pub async fn fixture() -> (Database, Arc<WorkflowRegistry>, ExecutionEngine) {
        let db = Database::in_memory().await.unwrap();
        let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(db.pool().clone())));
        let engine = ExecutionEngine::new(
            Arc::new(ExecutorSet::new(Arc::new(LuaSandbox::default()), None, Arc::new(NoNetwork))),
            Arc::new(SqliteExecutionStore::new(db.pool().clone())),
            Arc::new(BroadcastPublisher::default()),
            EngineConfig::default(),
        );
        (db, registry, engine)
    }

    pub async fn wait_terminal(engine: &ExecutionEngine, execution_id: &str) -> ExecutionRun {
        for _ in 0..200 {
            if let Some(run) = engine.get(execution_id).await.unwrap() {
                if run.status != RunStatus::Pending && run.status != RunStatus::Running {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} did not finish", execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{fixture, wait_terminal};
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::workflow::types::{Edge, Node, RunStatus, Workflow};
    use serde_json::{json, Map};

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::local(&RateLimitConfig::default()))
    }

    fn manual_workflow(status: WorkflowStatus) -> Workflow {
        Workflow {
            id: "wf-manual".into(),
            name: "manual".into(),
            version: 1,
            status,
            nodes: vec![
                Node::new("go", NodeType::ManualTrigger, json!({})),
                Node::new("double", NodeType::Transform, json!({ "code": "return input.n * 2" })),
            ],
            edges: vec![Edge::new("go", "double")],
            variables: Map::new(),
        }
    }

    #[tokio::test]
    async fn authorized_principal_starts_a_run() {
        let (_db, registry, engine) = fixture().await;
        registry.insert(manual_workflow(WorkflowStatus::Draft)).unwrap();
        let dispatcher = TriggerDispatcher::new(registry, engine.clone(), Arc::new(AllowAll), limiter());

        let pending = dispatcher.run_manual("wf-manual", json!({ "n": 21 }), &Principal::user("alice")).await.unwrap();
        assert_eq!(pending.trigger, TriggerSource::Manual);

        let run = wait_terminal(&engine, &pending.id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node_results["double"].output, Some(json!(42)));
    }

    #[tokio::test]
    async fn authorizer_can_refuse() {
        let (_db, registry, engine) = fixture().await;
        registry.insert(manual_workflow(WorkflowStatus::Active)).unwrap();
        let dispatcher = TriggerDispatcher::new(registry, engine, Arc::new(UserAllowList::new(["bob"])), limiter());

        let err = dispatcher.run_manual("wf-manual", json!({}), &Principal::user("mallory")).await.unwrap_err();
        assert!(matches!(err, TriggerError::Forbidden(_)));
        let err = dispatcher.run_manual("wf-manual", json!({}), &Principal::anonymous()).await.unwrap_err();
        assert!(matches!(err, TriggerError::Forbidden(_)));
        assert!(dispatcher.run_manual("wf-manual", json!({ "n": 1 }), &Principal::user("bob")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_and_disabled_workflows_are_refused() {
        let (_db, registry, engine) = fixture().await;
        registry.insert(manual_workflow(WorkflowStatus::Disabled)).unwrap();
        let dispatcher = TriggerDispatcher::new(registry, engine, Arc::new(AllowAll), limiter());

        assert!(matches!(
            dispatcher.run_manual("nope", json!({}), &Principal::anonymous()).await,
            Err(TriggerError::NotFound(_))
        ));
        assert!(matches!(
            dispatcher.run_manual("wf-manual", json!({}), &Principal::anonymous()).await,
            Err(TriggerError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn manual_runs_are_admitted_per_workflow() {
        let (_db, registry, engine) = fixture().await;
        let mut workflow = manual_workflow(WorkflowStatus::Active);
        workflow.nodes[0] = Node::new("go", NodeType::ManualTrigger, json!({ "rate_limit": { "per_minute": 2 } }));
        registry.insert(workflow).unwrap();
        let dispatcher = TriggerDispatcher::new(registry, engine, Arc::new(AllowAll), limiter());

        for n in 0..2 {
            assert!(dispatcher.run_manual("wf-manual", json!({ "n": n }), &Principal::user("alice")).await.is_ok());
        }
        let err = dispatcher.run_manual("wf-manual", json!({ "n": 3 }), &Principal::user("alice")).await.unwrap_err();
        assert!(matches!(err, TriggerError::RateLimited { .. }));
        let retry_after = err.retry_after_secs().unwrap();
        assert!((1..=60).contains(&retry_after));
    }

    #[tokio::test]
    async fn refused_principals_do_not_consume_admission() {
        let (_db, registry, engine) = fixture().await;
        let mut workflow = manual_workflow(WorkflowStatus::Active);
        workflow.nodes[0] = Node::new("go", NodeType::ManualTrigger, json!({ "rate_limit": { "per_minute": 1 } }));
        registry.insert(workflow).unwrap();
        let dispatcher = TriggerDispatcher::new(registry, engine, Arc::new(UserAllowList::new(["bob"])), limiter());

        for _ in 0..3 {
            let err = dispatcher.run_manual("wf-manual", json!({}), &Principal::user("mallory")).await.unwrap_err();
            assert!(matches!(err, TriggerError::Forbidden(_)));
        }
        assert!(dispatcher.run_manual("wf-manual", json!({ "n": 1 }), &Principal::user("bob")).await.is_ok());
    }
}
