/// Hot-reload workflow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory workflow registry.
/// Each workflow update swaps the entire registry pointer, so concurrent runs
/// keep the definition they started with while new triggers see the new one.

use crate::store::workflows::WorkflowStorage;
use crate::workflow::graph::validate_workflow;
use crate::workflow::types::{NodeType, Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free workflow registry for hot-reload capabilities
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: compiled workflow definition
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,

    /// Reference to persistent storage for reload operations
    storage: WorkflowStorage,
}

/// Validated workflow with the lookups triggers need
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Shared so runs can hold the definition without copying it
    pub workflow: Arc<Workflow>,

    /// Webhook secret tokens mapped to their trigger node id
    pub webhook_tokens: HashMap<String, String>,

    /// CronTrigger node ids
    pub cron_node_ids: Vec<String>,
}

impl CompiledWorkflow {
    /// Validate and extract trigger metadata
    pub fn compile(workflow: Workflow) -> Result<Self> {
        validate_workflow(&workflow)
            .map_err(|e| anyhow::anyhow!("Workflow '{}' is invalid: {}", workflow.id, e))?;

        let mut webhook_tokens = HashMap::new();
        let mut cron_node_ids = Vec::new();

        for node in &workflow.nodes {
            match node.node_type {
                NodeType::Webhook => {
                    if let Some(token) = node.config_str("token") {
                        webhook_tokens.insert(token.to_string(), node.id.clone());
                    }
                }
                NodeType::CronTrigger => cron_node_ids.push(node.id.clone()),
                _ => {}
            }
        }

        if webhook_tokens.is_empty() && cron_node_ids.is_empty() {
            tracing::debug!("📋 Workflow '{}' has no webhook or cron triggers (manual runs only)", workflow.id);
        }

        Ok(Self {
            workflow: Arc::new(workflow),
            webhook_tokens,
            cron_node_ids,
        })
    }
}

impl WorkflowRegistry {
    /// Create new registry instance with storage backend
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Populate the registry from storage at startup
    ///
    /// Invalid stored workflows are logged and left out rather than failing startup.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored_workflows = self.storage.load_all_workflows().await?;
        let mut compiled = HashMap::new();

        for (id, workflow) in stored_workflows {
            match CompiledWorkflow::compile(workflow) {
                Ok(c) => {
                    compiled.insert(id, c);
                }
                Err(e) => tracing::error!("❌ Skipping stored workflow '{}': {}", id, e),
            }
        }

        self.workflows.store(Arc::new(compiled));

        tracing::info!("Initialized workflow registry with {} workflows",
            self.workflows.load().len());

        Ok(())
    }

    /// Hot-reload a single workflow from storage
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.storage.get_workflow(workflow_id).await?
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", workflow_id))?;
        self.insert(workflow)?;

        tracing::info!("Hot-reloaded workflow: {}", workflow_id);
        Ok(())
    }

    /// Compile and swap in a workflow without touching storage
    pub fn insert(&self, workflow: Workflow) -> Result<()> {
        let id = workflow.id.clone();
        let compiled = CompiledWorkflow::compile(workflow)?;

        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(id.clone(), compiled.clone());
            next
        });
        Ok(())
    }

    /// Get a workflow by ID (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Get all workflows (used by the scheduler)
    pub fn get_all_workflows(&self) -> Vec<Arc<Workflow>> {
        self.workflows.load()
            .values()
            .map(|compiled| Arc::clone(&compiled.workflow))
            .collect()
    }

    /// Resolve a webhook token to its workflow and trigger node
    pub fn find_by_token(&self, token: &str) -> Option<(CompiledWorkflow, String)> {
        self.workflows.load().values().find_map(|compiled| {
            compiled
                .webhook_tokens
                .get(token)
                .map(|node_id| (compiled.clone(), node_id.clone()))
        })
    }

    /// Workflow currently owning a webhook token, if any
    pub fn token_owner(&self, token: &str) -> Option<String> {
        self.find_by_token(token).map(|(c, _)| c.workflow.id.clone())
    }

    /// Remove a workflow from registry
    pub fn remove_workflow(&self, workflow_id: &str) {
        let current = self.workflows.load();
        if !current.contains_key(workflow_id) {
            return;
        }
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            next
        });
        tracing::info!("Removed workflow from registry: {}", workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::Database;
    use crate::workflow::types::{Edge, Node, WorkflowStatus};
    use serde_json::{json, Map};

    fn hooked(id: &str, token: &str) -> Workflow {
        Workflow {
            id: id.into(),
            name: id.into(),
            version: 1,
            status: WorkflowStatus::Active,
            nodes: vec![
                Node::new("hook", NodeType::Webhook, json!({ "token": token })),
                Node::new("tick", NodeType::CronTrigger, json!({ "schedule": "0 * * * * *" })),
                Node::new("t", NodeType::Transform, json!({ "code": "return input" })),
            ],
            edges: vec![Edge::new("hook", "t"), Edge::new("tick", "t")],
            variables: Map::new(),
        }
    }

    #[tokio::test]
    async fn reload_picks_up_stored_workflow_and_tokens() {
        let db = Database::in_memory().await.unwrap();
        let storage = WorkflowStorage::new(db.pool().clone());
        let registry = WorkflowRegistry::new(storage.clone());

        storage.save_workflow(&hooked("wf-a", "tok-a")).await.unwrap();
        registry.reload_workflow("wf-a").await.unwrap();

        let (compiled, node_id) = registry.find_by_token("tok-a").unwrap();
        assert_eq!(compiled.workflow.id, "wf-a");
        assert_eq!(node_id, "hook");
        assert_eq!(compiled.cron_node_ids, vec!["tick".to_string()]);
        assert!(registry.find_by_token("tok-b").is_none());

        registry.remove_workflow("wf-a");
        assert!(registry.get_workflow("wf-a").is_none());
    }

    #[tokio::test]
    async fn invalid_workflow_is_not_registered() {
        let db = Database::in_memory().await.unwrap();
        let registry = WorkflowRegistry::new(WorkflowStorage::new(db.pool().clone()));
        let mut wf = hooked("wf-bad", "tok");
        wf.edges.push(Edge::new("t", "hook"));
        assert!(registry.insert(wf).is_err());
        assert!(registry.get_workflow("wf-bad").is_none());
    }
}
