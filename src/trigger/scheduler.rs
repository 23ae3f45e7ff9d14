/// Background cron scheduler service
///
/// Registers `CronTrigger` nodes with tokio-cron-scheduler and keeps them in
/// sync as workflows change. Each firing re-reads the registry, passes the
/// admission guard under `schedule:<workflow>:<node>` and then starts a run
/// from that trigger.

use crate::ratelimit::{limits_from_node_config, Admission, RateLimiter};
use crate::runtime::ExecutionEngine;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::types::{Node, NodeType, RunRequest, TriggerSource, Workflow};
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// What happened when a schedule fired
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Started(String),
    /// Workflow or node gone, or not active
    Skipped,
    Throttled { retry_after_ms: u64 },
    Failed(String),
}

/// Everything a firing needs, cloned into each job closure
#[derive(Clone)]
pub struct ScheduleFiring {
    registry: Arc<WorkflowRegistry>,
    engine: ExecutionEngine,
    limiter: Arc<RateLimiter>,
}

impl ScheduleFiring {
    pub fn new(registry: Arc<WorkflowRegistry>, engine: ExecutionEngine, limiter: Arc<RateLimiter>) -> Self {
        Self { registry, engine, limiter }
    }

    pub async fn fire(&self, workflow_id: &str, node_id: &str) -> FireOutcome {
        tracing::debug!("🔔 Cron trigger activated: {} in workflow {}", node_id, workflow_id);

        // The definition may have changed or disappeared since registration
        let Some(compiled) = self.registry.get_workflow(workflow_id) else {
            tracing::debug!("⏭️ Skipping cron trigger for deleted workflow: {}", workflow_id);
            return FireOutcome::Skipped;
        };
        let workflow = compiled.workflow;
        let Some(node) = workflow.node(node_id).filter(|n| n.node_type == NodeType::CronTrigger) else {
            tracing::debug!("⏭️ Cron node '{}' no longer exists in workflow {}", node_id, workflow_id);
            return FireOutcome::Skipped;
        };
        if !workflow.is_active() {
            tracing::debug!("⏭️ Workflow '{}' is not active, skipping schedule", workflow_id);
            return FireOutcome::Skipped;
        }

        let key = format!("schedule:{}:{}", workflow_id, node_id);
        let limits = limits_from_node_config(&node.config).unwrap_or_else(|| self.limiter.default_limits().to_vec());
        match self.limiter.check(&key, &limits).await {
            Ok(Admission::Allowed) => {}
            Ok(Admission::Denied { retry_after_ms, .. }) => {
                return FireOutcome::Throttled { retry_after_ms };
            }
            Err(e) => {
                tracing::error!("❌ Admission unavailable for schedule '{}': {}", key, e);
                return FireOutcome::Failed(e.to_string());
            }
        }

        let input = json!({
            "scheduled_at": Utc::now().to_rfc3339(),
            "schedule": node.config_str("schedule"),
        });
        let request = RunRequest::from_trigger(TriggerSource::Schedule, node_id, input);

        match self.engine.run(Arc::clone(&workflow), request).await {
            Ok(run) => {
                tracing::info!("🚀 Cron-triggered execution {} for workflow: {}", run.id, workflow_id);
                FireOutcome::Started(run.id)
            }
            Err(e) => {
                tracing::error!("❌ Cron-triggered workflow failed to start: {} - Error: {}", workflow_id, e);
                FireOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Hot-reload cron scheduler service
///
/// Job UUIDs are tracked per `workflow:node` so an updated schedule replaces
/// the old job instead of adding a second one.
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    registry: Arc<WorkflowRegistry>,
    firing: ScheduleFiring,
}

impl CronSchedulerService {
    pub async fn new(registry: Arc<WorkflowRegistry>, engine: ExecutionEngine, limiter: Arc<RateLimiter>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            firing: ScheduleFiring::new(Arc::clone(&registry), engine, limiter),
            registry,
        })
    }

    /// Register every cron trigger in the registry and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting hot-reload cron scheduler service");

        self.register_all_cron_triggers().await?;
        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Hot-reload cron scheduler started successfully");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping hot-reload cron scheduler service");

        self.job_uuid_map.write().await.clear();
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Hot-reload cron scheduler stopped");
        Ok(())
    }

    /// Bring a workflow's cron jobs in line with its current definition
    pub async fn sync_workflow(&self, workflow: &Workflow) -> Result<()> {
        tracing::info!("🔥 Hot-reloading cron triggers for workflow: {}", workflow.id);

        // Drop jobs for nodes that were removed or are no longer cron triggers
        self.remove_workflow_cron_triggers(&workflow.id).await;

        let cron_nodes: Vec<&Node> = workflow
            .nodes
            .iter()
            .filter(|node| node.node_type == NodeType::CronTrigger)
            .collect();
        if cron_nodes.is_empty() {
            tracing::debug!("📋 No cron triggers found in workflow: {}", workflow.id);
            return Ok(());
        }

        for cron_node in &cron_nodes {
            self.add_cron_job(&workflow.id, cron_node).await?;
        }

        tracing::info!("🔥 Hot-reloaded {} cron triggers for workflow: {}", cron_nodes.len(), workflow.id);
        Ok(())
    }

    /// Remove all cron jobs belonging to a workflow
    pub async fn remove_workflow_cron_triggers(&self, workflow_id: &str) {
        let prefix = format!("{}:", workflow_id);
        let mut job_uuid_map = self.job_uuid_map.write().await;
        let keys: Vec<String> = job_uuid_map
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();

        for key in keys {
            if let Some(job_uuid) = job_uuid_map.remove(&key) {
                let scheduler = self.scheduler.read().await;
                if let Err(e) = scheduler.remove(&job_uuid).await {
                    tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", key, e);
                } else {
                    tracing::debug!("🛑 Removed cron job from scheduler: {}", key);
                }
            }
        }
    }

    /// Keys (`workflow:node`) of the jobs currently registered
    pub async fn registered_jobs(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.job_uuid_map.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn add_cron_job(&self, workflow_id: &str, cron_node: &Node) -> Result<()> {
        let schedule = cron_node
            .config_str("schedule")
            .ok_or_else(|| anyhow::anyhow!("CronTrigger '{}' missing 'schedule'", cron_node.id))?;
        let job_id = format!("{}:{}", workflow_id, cron_node.id);

        let workflow_id_owned = workflow_id.to_string();
        let cron_node_id = cron_node.id.clone();
        let firing = self.firing.clone();

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let workflow_id = workflow_id_owned.clone();
            let cron_node_id = cron_node_id.clone();
            let firing = firing.clone();

            Box::pin(async move {
                match firing.fire(&workflow_id, &cron_node_id).await {
                    FireOutcome::Throttled { retry_after_ms } => {
                        tracing::warn!("🚦 Schedule {}:{} throttled, next slot in {}ms", workflow_id, cron_node_id, retry_after_ms);
                    }
                    FireOutcome::Started(_) | FireOutcome::Skipped | FireOutcome::Failed(_) => {}
                }
            })
        })?;

        let new_job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.job_uuid_map.write().await.insert(job_id.clone(), new_job_uuid);

        tracing::info!("🔥 Registered cron job: {} ({})", job_id, schedule);
        Ok(())
    }

    async fn register_all_cron_triggers(&self) -> Result<()> {
        let workflows = self.registry.get_all_workflows();
        let workflow_count = workflows.len();
        let mut total_triggers = 0;

        for workflow in workflows {
            let trigger_count = workflow
                .nodes
                .iter()
                .filter(|node| node.node_type == NodeType::CronTrigger)
                .count();
            if trigger_count > 0 {
                self.sync_workflow(&workflow).await?;
                total_triggers += trigger_count;
            }
        }

        tracing::info!("📊 Registered {} total cron triggers from {} workflows", total_triggers, workflow_count);
        Ok(())
    }
}
