/// Core workflow and execution type definitions
///
/// Workflows are authored elsewhere and handed to the engine read-only. They are
/// serialized as JSON for persistence and compiled into petgraph DAGs for execution.
/// Execution runs and node results are the engine-owned records of one invocation.

use crate::error::{EngineError, NodeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A complete workflow definition containing nodes and their connections
///
/// Immutable per version: updates through the API store a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-grading")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Run-scoped constants exposed to transforms as `vars`
    #[serde(default)]
    pub variables: Map<String, Value>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    #[default]
    Active,
    Disabled,
}

impl Workflow {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }
}

/// A single node in the workflow DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "webhook-start")
    pub id: String,
    /// The type of node which determines execution behavior
    pub node_type: NodeType,
    /// Node-specific configuration as flexible JSON
    #[serde(default)]
    pub config: Value,
    /// What happens to the rest of the run when this node fails
    #[serde(default)]
    pub on_error: FailurePolicy,
    /// Per-node timeout; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type,
            config,
            on_error: FailurePolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Read a string field from the node config
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }
}

/// Closed set of node types
///
/// Each variant is mapped to exactly one executor in `runtime::executor::ExecutorSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// HTTP webhook trigger
    /// Expected config: { "token": "...", "secret"?: "...", "allowed_ips"?: [...], "rate_limit"?: {...}, "active"?: true }
    Webhook,

    /// Background cron trigger
    /// Expected config: { "schedule": "0 */1 * * * *" }
    CronTrigger,

    /// Programmatic / manual run entry point
    ManualTrigger,

    /// Branching node selecting the "true" or "false" handle
    /// Expected config: { "expression": "$json.result", "operator"?: "gt", "value"?: 5 }
    Condition,

    /// User-authored Lua executed in the sandbox
    /// Expected config: { "code": "return { result = input.x > 5 }" }
    Transform,

    /// HTTP client for external API calls
    /// Expected config: { "url": "https://api.example.com/data", "method": "GET", "headers": {...} }
    HTTPClient,

    /// Agent / LLM call through an HTTP agent endpoint
    /// Expected config: { "endpoint": "https://agent.internal/run", "prompt": "...", "model"?: "..." }
    Agent,
}

impl NodeType {
    pub fn is_trigger(&self) -> bool {
        matches!(self, NodeType::Webhook | NodeType::CronTrigger | NodeType::ManualTrigger)
    }
}

/// Failure handling for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel everything not yet finished and fail the run
    #[default]
    Abort,
    /// Skip only the failed node's dependents; independent branches continue
    Isolate,
}

/// Connection between two nodes in the workflow DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    /// Source node ID
    pub from: String,
    /// Target node ID
    pub to: String,
    /// Output handle of the source this edge follows ("true"/"false" for conditions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            id: format!("{}->{}", from, to),
            from,
            to,
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        let handle = handle.into();
        self.id = format!("{}:{}->{}", self.from, handle, self.to);
        self.source_handle = Some(handle);
        self
    }
}

/// How a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    Schedule,
    #[default]
    Manual,
}

/// Everything needed to start a run besides the workflow itself
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub trigger_input: Value,
    /// Trigger node that fired; other triggers are skipped
    pub start_node_id: Option<String>,
    pub source: TriggerSource,
    pub user_id: Option<String>,
    /// Overrides the engine's run timeout
    pub run_timeout_ms: Option<u64>,
}

impl RunRequest {
    pub fn manual(trigger_input: Value) -> Self {
        Self {
            trigger_input,
            ..Default::default()
        }
    }

    pub fn from_trigger(source: TriggerSource, start_node_id: impl Into<String>, trigger_input: Value) -> Self {
        Self {
            trigger_input,
            start_node_id: Some(start_node_id.into()),
            source,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    Canceled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// Allowed moves: pending -> running -> terminal, or pending -> skipped / canceled
    fn can_transition_to(&self, next: NodeStatus) -> bool {
        match self {
            NodeStatus::Pending => matches!(next, NodeStatus::Running | NodeStatus::Skipped | NodeStatus::Canceled),
            NodeStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Per-node state inside an execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    /// Handle chosen by a condition node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for NodeResult {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            selected_handle: None,
            started_at: None,
            completed_at: None,
        }
    }
}

impl NodeResult {
    /// Move to `next`, rejecting backward or repeated terminal transitions
    pub fn transition(&mut self, next: NodeStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "illegal node status transition {:?} -> {:?}",
                self.status, next
            )));
        }
        let now = Utc::now();
        if next == NodeStatus::Running {
            self.started_at = Some(now);
        } else if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// One invocation of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: RunStatus,
    pub trigger: TriggerSource,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub node_results: BTreeMap<String, NodeResult>,
}

impl ExecutionRun {
    /// Create a pending run with one pending result per node
    pub fn pending(workflow: &Workflow, trigger: TriggerSource) -> Self {
        let node_results = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeResult::default()))
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            status: RunStatus::Pending,
            trigger,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            node_results,
        }
    }

    /// Wall-clock duration so far, or total once terminal
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds())
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        self.node_results.values().filter(|r| r.status == status).count()
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results.get(node_id).map(|r| r.status)
    }
}
