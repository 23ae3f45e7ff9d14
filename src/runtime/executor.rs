/// Node execution contract and the compile-time executor registry
///
/// Every node type maps to exactly one executor through an exhaustive `match`
/// in `ExecutorSet::for_type`:
/// - Webhook / CronTrigger / ManualTrigger: pass the trigger input through
/// - Condition: branch selection (`condition.rs`)
/// - Transform: sandboxed Lua (`transform.rs`)
/// - HTTPClient / Agent: external calls with retry (`external.rs`)

use crate::error::EngineError;
use crate::runtime::condition::ConditionExecutor;
use crate::runtime::external::{ExternalCallExecutor, ExternalClient};
use crate::runtime::transform::TransformExecutor;
use crate::sandbox::{AuditLog, Sandbox};
use crate::workflow::types::{Node, NodeType};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// What a node produced; the orchestrator folds it into the `NodeResult`
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub output: Value,
    /// Set by condition nodes only
    pub selected_handle: Option<String>,
}

impl NodeOutcome {
    pub fn output(output: Value) -> Self {
        Self {
            output,
            selected_handle: None,
        }
    }

    pub fn branch(output: Value, handle: impl Into<String>) -> Self {
        Self {
            output,
            selected_handle: Some(handle.into()),
        }
    }
}

/// Read-only view of the run handed to an executor
#[derive(Debug, Clone, Default)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: Option<String>,
    pub trigger_input: Value,
    /// Outputs of nodes completed before this one started
    pub outputs: HashMap<String, Value>,
    /// Workflow variables, exposed to transforms as `vars`
    pub variables: Value,
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute `node` against `input`
    ///
    /// Timeouts are applied by the caller; implementations only need to be
    /// cancel-safe at their await points.
    async fn execute(&self, node: &Node, input: Value, ctx: &NodeContext) -> Result<NodeOutcome, EngineError>;
}

/// Entry points hand their trigger input to the next nodes unchanged
#[derive(Debug, Default)]
pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    async fn execute(&self, node: &Node, input: Value, _ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        tracing::debug!("🎯 Trigger '{}' ({:?}) passing input through", node.id, node.node_type);
        Ok(NodeOutcome::output(input))
    }
}

/// One executor per node kind
pub struct ExecutorSet {
    trigger: TriggerExecutor,
    condition: ConditionExecutor,
    transform: TransformExecutor,
    external: ExternalCallExecutor,
}

impl ExecutorSet {
    pub fn new(sandbox: Arc<dyn Sandbox>, audit: Option<AuditLog>, client: Arc<dyn ExternalClient>) -> Self {
        Self {
            trigger: TriggerExecutor,
            condition: ConditionExecutor,
            transform: TransformExecutor::new(sandbox, audit),
            external: ExternalCallExecutor::new(client),
        }
    }

    pub fn for_type(&self, node_type: NodeType) -> &dyn NodeExecutor {
        match node_type {
            NodeType::Webhook | NodeType::CronTrigger | NodeType::ManualTrigger => &self.trigger,
            NodeType::Condition => &self.condition,
            NodeType::Transform => &self.transform,
            NodeType::HTTPClient | NodeType::Agent => &self.external,
        }
    }

    /// Dispatch to the executor for `node.node_type`
    pub async fn execute(&self, node: &Node, input: Value, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        tracing::info!("🚀 Starting node execution: {} (type: {:?})", node.id, node.node_type);
        let start_time = std::time::Instant::now();

        let result = self.for_type(node.node_type).execute(node, input, ctx).await;

        match &result {
            Ok(outcome) => tracing::info!("✅ Node '{}' completed in {:?}{}", node.id, start_time.elapsed(),
                outcome.selected_handle.as_deref().map(|h| format!(" (handle: {})", h)).unwrap_or_default()),
            Err(e) => tracing::warn!("❌ Node '{}' failed after {:?}: {}", node.id, start_time.elapsed(), e),
        }
        result
    }
}
