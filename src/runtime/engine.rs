/// Petgraph-based DAG execution engine
///
/// Converts a workflow into a validated DAG and drives it with a ready queue:
/// ready nodes run concurrently on a `JoinSet` (bounded by `max_concurrency`),
/// and every completion flows back into the single task that owns the
/// `ExecutionRun`. Only that task mutates node results, so no locking is
/// needed around run state.
///
/// Edge resolution when a node settles:
/// - completed: an edge is taken unless its handle differs from the selected one
/// - skipped / canceled: its edges are not taken
/// - failed (isolate policy): its edges are marked failed
///
/// A dependent is decided once all of its incoming edges are resolved: any
/// failed edge skips it with an upstream-failure error, otherwise any taken
/// edge makes it ready, otherwise it is skipped. Skips cascade.

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, NodeError, TimeoutScope};
use crate::runtime::events::{EventPublisher, ExecutionEvent};
use crate::runtime::executor::{ExecutorSet, NodeContext, NodeOutcome};
use crate::store::ExecutionRepository;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::types::{
    ExecutionRun, FailurePolicy, NodeStatus, RunRequest, RunStatus, Workflow,
};
use chrono::Utc;
use futures::FutureExt;
use petgraph::graph::{EdgeIndex, NodeIndex};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// DAG execution engine
///
/// Cheap to clone; clones share the executor set, repository, publisher and
/// the table of active runs.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    executors: Arc<ExecutorSet>,
    repository: Arc<dyn ExecutionRepository>,
    events: Arc<dyn EventPublisher>,
    config: EngineConfig,
    /// Cancellation handles of runs that have not finished yet
    active_runs: Mutex<HashMap<String, CancellationToken>>,
}

impl EngineInner {
    fn active_runs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active_runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Taken,
    NotTaken,
    Failed,
}

/// How a settled node resolves its outgoing edges
#[derive(Debug, Clone)]
enum Settled {
    Completed(Option<String>),
    Skipped,
    Failed,
}

/// Why a run stopped before its graph drained
enum Interrupt {
    Canceled,
    TimedOut(u64),
    Aborted { node_id: String, error: NodeError },
}

type NodeTaskResult = (NodeIndex, Result<NodeOutcome, EngineError>);

impl ExecutionEngine {
    pub fn new(
        executors: Arc<ExecutorSet>,
        repository: Arc<dyn ExecutionRepository>,
        events: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                executors,
                repository,
                events,
                config,
                active_runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate, persist a pending run and drive it in the background
    ///
    /// Returns the pending snapshot immediately; progress is observable through
    /// `get` and the event publisher.
    pub async fn run(&self, workflow: Arc<Workflow>, request: RunRequest) -> Result<ExecutionRun, EngineError> {
        let driver = self.prepare(workflow, request).await?;
        let snapshot = driver.run.clone();
        tokio::spawn(driver.drive());
        Ok(snapshot)
    }

    /// Like `run`, but waits for the terminal run
    pub async fn execute(&self, workflow: Arc<Workflow>, request: RunRequest) -> Result<ExecutionRun, EngineError> {
        let driver = self.prepare(workflow, request).await?;
        Ok(driver.drive().await)
    }

    /// Request cancellation; false when the run is unknown or already finished
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.inner.active_runs().get(execution_id) {
            Some(token) => {
                tracing::info!("🛑 Cancel requested for execution {}", execution_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRun>, EngineError> {
        Ok(self.inner.repository.get_run(execution_id).await?)
    }

    /// Most recent runs of a workflow, newest first
    pub async fn list(&self, workflow_id: &str, limit: i64) -> Result<Vec<ExecutionRun>, EngineError> {
        Ok(self.inner.repository.list_runs(workflow_id, limit).await?)
    }

    pub fn active_runs(&self) -> usize {
        self.inner.active_runs().len()
    }

    async fn prepare(&self, workflow: Arc<Workflow>, request: RunRequest) -> Result<RunDriver, EngineError> {
        let graph = WorkflowGraph::build(&workflow)?;

        if let Some(start) = &request.start_node_id {
            let index = graph
                .index_of(start)
                .ok_or_else(|| EngineError::Validation(format!("start node '{}' does not exist", start)))?;
            if !graph.node(index).node_type.is_trigger() {
                return Err(EngineError::Validation(format!("start node '{}' is not a trigger", start)));
            }
            if graph.incoming(index).next().is_some() {
                return Err(EngineError::Validation(format!("start node '{}' has incoming edges", start)));
            }
        }

        let run = ExecutionRun::pending(&workflow, request.source);
        self.inner.repository.save_run(&run).await?;

        let token = CancellationToken::new();
        self.inner.active_runs().insert(run.id.clone(), token.clone());

        tracing::info!("🚀 Created execution {} for workflow '{}' v{} ({:?})",
            run.id, workflow.id, workflow.version, request.source);

        Ok(RunDriver {
            engine: Arc::clone(&self.inner),
            variables: Value::Object(workflow.variables.clone()),
            workflow,
            graph,
            run,
            request,
            token,
            edge_states: HashMap::new(),
            outputs: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            task_nodes: HashMap::new(),
        })
    }
}

/// Single writer for one run
struct RunDriver {
    engine: Arc<EngineInner>,
    workflow: Arc<Workflow>,
    variables: Value,
    graph: WorkflowGraph,
    run: ExecutionRun,
    request: RunRequest,
    token: CancellationToken,
    edge_states: HashMap<EdgeIndex, EdgeState>,
    outputs: HashMap<String, Value>,
    ready: VecDeque<NodeIndex>,
    in_flight: HashSet<NodeIndex>,
    /// Which node each spawned task runs
    task_nodes: HashMap<TaskId, NodeIndex>,
}

impl RunDriver {
    async fn drive(mut self) -> ExecutionRun {
        let run_timeout_ms = self
            .request
            .run_timeout_ms
            .unwrap_or(self.engine.config.run_timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(run_timeout_ms);
        let max_concurrency = self.engine.config.max_concurrency.max(1);
        let token = self.token.clone();

        self.run.status = RunStatus::Running;
        self.run.started_at = Some(Utc::now());
        self.engine.events.publish(ExecutionEvent::RunStarted {
            execution_id: self.run.id.clone(),
            workflow_id: self.workflow.id.clone(),
            at: Utc::now(),
        });
        tracing::info!("▶️ Running execution {} ({} nodes, {} edges, concurrency {})",
            self.run.id, self.graph.node_count(), self.graph.edge_count(), max_concurrency);

        self.seed().await;

        let mut tasks: JoinSet<NodeTaskResult> = JoinSet::new();
        let interrupt = loop {
            if token.is_cancelled() {
                break Some(Interrupt::Canceled);
            }
            while self.in_flight.len() < max_concurrency {
                let Some(index) = self.ready.pop_front() else {
                    break;
                };
                self.spawn_node(&mut tasks, index).await;
            }
            if tasks.is_empty() {
                break None;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break Some(Interrupt::Canceled),
                _ = tokio::time::sleep_until(deadline) => break Some(Interrupt::TimedOut(run_timeout_ms)),
                joined = tasks.join_next_with_id() => match joined {
                    Some(Ok((task_id, (index, result)))) => {
                        self.task_nodes.remove(&task_id);
                        if let Some(interrupt) = self.complete(index, result).await {
                            break Some(interrupt);
                        }
                    }
                    Some(Err(join_err)) => {
                        if let Some(interrupt) = self.task_lost(join_err).await {
                            break Some(interrupt);
                        }
                    }
                    None => {}
                },
            }
        };

        match interrupt {
            Some(interrupt) => {
                tasks.shutdown().await;
                self.interrupt(interrupt);
            }
            None => self.settle_run(),
        }

        self.finish().await
    }

    /// Initial ready set; with a start trigger, the other triggers are skipped
    async fn seed(&mut self) {
        let mut skipped = Vec::new();
        for root in self.graph.roots() {
            let node = self.graph.node(root);
            let skip = match &self.request.start_node_id {
                Some(start) => node.node_type.is_trigger() && &node.id != start,
                None => false,
            };
            if skip {
                skipped.push(root);
            } else {
                self.ready.push_back(root);
            }
        }

        for root in skipped {
            let node_id = self.graph.node(root).id.clone();
            tracing::debug!("⏭️ Skipping trigger '{}' (run started from another trigger)", node_id);
            self.set_status(&node_id, NodeStatus::Skipped, None);
            self.resolve(root, Settled::Skipped);
        }
        self.persist().await;
    }

    /// Input for a node: trigger input for roots, the single taken predecessor's
    /// output, or an object keyed by predecessor id when several are taken
    fn input_for(&self, index: NodeIndex) -> Value {
        let mut taken: BTreeMap<String, Value> = BTreeMap::new();
        let mut has_incoming = false;
        for (edge, source) in self.graph.incoming(index) {
            has_incoming = true;
            if self.edge_states.get(&edge) == Some(&EdgeState::Taken) {
                let id = self.graph.node(source).id.clone();
                let output = self.outputs.get(&id).cloned().unwrap_or(Value::Null);
                taken.insert(id, output);
            }
        }

        if !has_incoming {
            return self.request.trigger_input.clone();
        }
        if taken.len() == 1 {
            return taken.into_values().next().unwrap_or(Value::Null);
        }
        Value::Object(taken.into_iter().collect::<Map<String, Value>>())
    }

    async fn spawn_node(&mut self, tasks: &mut JoinSet<NodeTaskResult>, index: NodeIndex) {
        let node = self.graph.node(index).clone();
        let input = self.input_for(index);

        self.set_status(&node.id, NodeStatus::Running, None);
        self.persist().await;
        self.in_flight.insert(index);

        let ctx = NodeContext {
            execution_id: self.run.id.clone(),
            workflow_id: self.workflow.id.clone(),
            user_id: self.request.user_id.clone(),
            trigger_input: self.request.trigger_input.clone(),
            outputs: self.outputs.clone(),
            variables: self.variables.clone(),
        };
        let executors = Arc::clone(&self.engine.executors);
        let timeout_ms = node.timeout_ms.unwrap_or(self.engine.config.default_node_timeout_ms);

        let handle = tasks.spawn(async move {
            let node_id = node.id.clone();
            let work = AssertUnwindSafe(executors.execute(&node, input, &ctx)).catch_unwind();
            let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), work).await;
            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_panic)) => Err(EngineError::node(&node_id, "executor panicked")),
                Err(_) => {
                    tracing::warn!("⏰ Node '{}' exceeded its {}ms timeout", node_id, timeout_ms);
                    Err(EngineError::Timeout { scope: TimeoutScope::Node, timeout_ms })
                }
            };
            (index, result)
        });
        self.task_nodes.insert(handle.id(), index);
    }

    /// A node task that ended without reporting back fails its node
    async fn task_lost(&mut self, join_err: JoinError) -> Option<Interrupt> {
        let Some(index) = self.task_nodes.remove(&join_err.id()) else {
            tracing::error!("❌ Untracked task in execution {} ended abnormally: {}", self.run.id, join_err);
            return None;
        };
        let node_id = self.graph.node(index).id.clone();
        tracing::error!("❌ Task for node '{}' in execution {} ended abnormally: {}", node_id, self.run.id, join_err);
        self.complete(index, Err(EngineError::node(&node_id, "node task ended abnormally"))).await
    }

    /// Apply one finished node task
    async fn complete(&mut self, index: NodeIndex, result: Result<NodeOutcome, EngineError>) -> Option<Interrupt> {
        self.in_flight.remove(&index);
        let node = self.graph.node(index);
        let node_id = node.id.clone();
        let policy = node.on_error;

        match result {
            Ok(outcome) => {
                self.outputs.insert(node_id.clone(), outcome.output.clone());
                if let Some(node_result) = self.run.node_results.get_mut(&node_id) {
                    node_result.output = Some(outcome.output);
                    node_result.selected_handle = outcome.selected_handle.clone();
                }
                self.set_status(&node_id, NodeStatus::Completed, None);
                self.resolve(index, Settled::Completed(outcome.selected_handle));
                self.persist().await;
                None
            }
            Err(err) => {
                let error = NodeError::from(&err);
                self.set_status(&node_id, NodeStatus::Failed, Some(error.clone()));
                match policy {
                    FailurePolicy::Abort => {
                        tracing::error!("💥 Node '{}' failed, aborting execution {}: {}", node_id, self.run.id, err);
                        self.persist().await;
                        Some(Interrupt::Aborted { node_id, error })
                    }
                    FailurePolicy::Isolate => {
                        tracing::warn!("🧯 Node '{}' failed, isolating its dependents: {}", node_id, err);
                        self.resolve(index, Settled::Failed);
                        self.persist().await;
                        None
                    }
                }
            }
        }
    }

    /// Resolve outgoing edges of a settled node and cascade decisions downstream
    fn resolve(&mut self, index: NodeIndex, settled: Settled) {
        let mut worklist = VecDeque::from([(index, settled)]);

        while let Some((source, settled)) = worklist.pop_front() {
            let edges: Vec<(EdgeIndex, NodeIndex, Option<String>)> = self
                .graph
                .outgoing(source)
                .map(|(edge, target, handle)| (edge, target, handle.map(str::to_string)))
                .collect();

            for (edge, target, handle) in edges {
                let state = match &settled {
                    Settled::Completed(selected) => match &handle {
                        Some(h) if selected.as_deref() != Some(h.as_str()) => EdgeState::NotTaken,
                        _ => EdgeState::Taken,
                    },
                    Settled::Skipped => EdgeState::NotTaken,
                    Settled::Failed => EdgeState::Failed,
                };
                self.edge_states.insert(edge, state);

                if let Some(next) = self.decide(target) {
                    worklist.push_back((target, next));
                }
            }
        }
    }

    /// Decide a pending node once every incoming edge is resolved
    fn decide(&mut self, index: NodeIndex) -> Option<Settled> {
        let node_id = self.graph.node(index).id.clone();
        if self.run.node_status(&node_id) != Some(NodeStatus::Pending) {
            return None;
        }

        let mut failed_sources = Vec::new();
        let mut any_taken = false;
        for (edge, source) in self.graph.incoming(index) {
            match self.edge_states.get(&edge) {
                None => return None,
                Some(EdgeState::Failed) => failed_sources.push(self.graph.node(source).id.clone()),
                Some(EdgeState::Taken) => any_taken = true,
                Some(EdgeState::NotTaken) => {}
            }
        }

        if !failed_sources.is_empty() {
            let error = NodeError::new(
                ErrorKind::UpstreamFailed,
                format!("upstream node(s) failed: {}", failed_sources.join(", ")),
            );
            tracing::debug!("⏭️ Skipping '{}' after upstream failure", node_id);
            self.set_status(&node_id, NodeStatus::Skipped, Some(error));
            Some(Settled::Skipped)
        } else if any_taken {
            self.ready.push_back(index);
            None
        } else {
            tracing::debug!("⏭️ Skipping '{}' (branch not taken)", node_id);
            self.set_status(&node_id, NodeStatus::Skipped, None);
            Some(Settled::Skipped)
        }
    }

    /// Cancel everything that has not finished
    fn interrupt(&mut self, interrupt: Interrupt) {
        let (run_status, run_error, node_error) = match interrupt {
            Interrupt::Canceled => {
                let error = NodeError::from(&EngineError::Canceled("run canceled".to_string()));
                (RunStatus::Canceled, error.clone(), error)
            }
            Interrupt::TimedOut(timeout_ms) => {
                tracing::warn!("⏰ Execution {} exceeded its {}ms run timeout", self.run.id, timeout_ms);
                let error = NodeError::from(&EngineError::Timeout { scope: TimeoutScope::Run, timeout_ms });
                (RunStatus::Failed, error.clone(), error)
            }
            Interrupt::Aborted { node_id, error } => {
                let canceled = NodeError::from(&EngineError::Canceled(format!("node '{}' failed", node_id)));
                (RunStatus::Failed, error, canceled)
            }
        };

        let order: Vec<NodeIndex> = self.graph.topo_order().to_vec();
        for index in order {
            let node_id = self.graph.node(index).id.clone();
            match self.run.node_status(&node_id) {
                Some(NodeStatus::Running) => {
                    self.set_status(&node_id, NodeStatus::Canceled, Some(node_error.clone()));
                }
                Some(NodeStatus::Pending) => self.set_status(&node_id, NodeStatus::Canceled, None),
                _ => {}
            }
        }
        self.in_flight.clear();
        self.task_nodes.clear();
        self.ready.clear();

        self.run.status = run_status;
        self.run.error = Some(run_error);
    }

    /// Derive the terminal status of a run that drained normally
    fn settle_run(&mut self) {
        let order: Vec<NodeIndex> = self.graph.topo_order().to_vec();
        let mut first_failure = None;
        for index in order {
            let node_id = self.graph.node(index).id.clone();
            match self.run.node_results.get(&node_id).map(|r| (r.status, r.error.clone())) {
                Some((NodeStatus::Pending, _)) => {
                    // Unreachable from every started node
                    self.set_status(&node_id, NodeStatus::Skipped, None);
                }
                Some((NodeStatus::Failed, error)) if first_failure.is_none() => {
                    first_failure = Some(error.unwrap_or_else(|| {
                        NodeError::new(ErrorKind::NodeExecution, format!("node '{}' failed", node_id))
                    }));
                }
                _ => {}
            }
        }

        match first_failure {
            Some(error) => {
                self.run.status = RunStatus::Failed;
                self.run.error = Some(error);
            }
            None => self.run.status = RunStatus::Completed,
        }
    }

    async fn finish(mut self) -> ExecutionRun {
        self.run.completed_at = Some(Utc::now());
        self.persist().await;
        self.engine.active_runs().remove(&self.run.id);

        tracing::info!("🏁 Execution {} finished: {:?} in {}ms ({} completed, {} skipped, {} failed, {} canceled)",
            self.run.id,
            self.run.status,
            self.run.duration_ms().unwrap_or(0),
            self.run.count_with_status(NodeStatus::Completed),
            self.run.count_with_status(NodeStatus::Skipped),
            self.run.count_with_status(NodeStatus::Failed),
            self.run.count_with_status(NodeStatus::Canceled));

        self.engine.events.publish(ExecutionEvent::RunFinished {
            execution_id: self.run.id.clone(),
            status: self.run.status,
            error: self.run.error.clone(),
            duration_ms: self.run.duration_ms(),
            at: Utc::now(),
        });
        self.run
    }

    /// Apply a monotonic status change and publish it
    fn set_status(&mut self, node_id: &str, status: NodeStatus, error: Option<NodeError>) {
        let Some(result) = self.run.node_results.get_mut(node_id) else {
            return;
        };
        if let Err(e) = result.transition(status) {
            tracing::error!("❌ Execution {}: {}", self.run.id, e);
            return;
        }
        if error.is_some() {
            result.error = error.clone();
        }
        self.engine.events.publish(ExecutionEvent::NodeStatusChanged {
            execution_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            status,
            error,
            at: Utc::now(),
        });
    }

    async fn persist(&self) {
        if let Err(e) = self.engine.repository.save_run(&self.run).await {
            tracing::error!("❌ Failed to persist execution {}: {}", self.run.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::BroadcastPublisher;
    use crate::runtime::external::{ExternalClient, ExternalError, ExternalRequest, ExternalResponse};
    use crate::sandbox::LuaSandbox;
    use crate::store::{Database, SqliteExecutionStore};
    use crate::workflow::types::{Edge, Node, NodeType, WorkflowStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps `delay_ms` per call and tracks peak concurrency
    struct SlowClient {
        delay_ms: u64,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowClient {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self { delay_ms, current: AtomicUsize::new(0), peak: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl ExternalClient for SlowClient {
        async fn send(&self, request: ExternalRequest) -> Result<ExternalResponse, ExternalError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ExternalResponse { status: 200, headers: Default::default(), body: json!({ "url": request.url }) })
        }
    }

    async fn engine_with(client: Arc<dyn ExternalClient>, config: EngineConfig) -> (ExecutionEngine, BroadcastPublisher) {
        let db = Database::in_memory().await.unwrap();
        let publisher = BroadcastPublisher::new(256);
        let executors = Arc::new(ExecutorSet::new(Arc::new(LuaSandbox::default()), None, client));
        let engine = ExecutionEngine::new(
            executors,
            Arc::new(SqliteExecutionStore::new(db.pool().clone())),
            Arc::new(publisher.clone()),
            config,
        );
        (engine, publisher)
    }

    async fn engine() -> ExecutionEngine {
        engine_with(SlowClient::new(0), EngineConfig::default()).await.0
    }

    fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Arc<Workflow> {
        Arc::new(Workflow {
            id: "wf-test".into(),
            name: "Test".into(),
            version: 1,
            status: WorkflowStatus::Active,
            nodes,
            edges,
            variables: Map::new(),
        })
    }

    fn transform(id: &str, code: &str) -> Node {
        Node::new(id, NodeType::Transform, json!({ "code": code }))
    }

    fn http(id: &str) -> Node {
        Node::new(id, NodeType::HTTPClient, json!({ "url": format!("https://svc.local/{}", id) }))
    }

    #[tokio::test]
    async fn condition_skips_the_untaken_branch() {
        let wf = workflow(
            vec![
                Node::new("start", NodeType::ManualTrigger, json!({})),
                Node::new("check", NodeType::Condition, json!({ "expression": "$json.x", "operator": "gt", "value": 5 })),
                transform("yes", "return 'big'"),
                transform("no", "return 'small'"),
                transform("no_after", "return input"),
            ],
            vec![
                Edge::new("start", "check"),
                Edge::new("check", "yes").with_handle("true"),
                Edge::new("check", "no").with_handle("false"),
                Edge::new("no", "no_after"),
            ],
        );

        let run = engine().await.execute(wf, RunRequest::manual(json!({ "x": 10 }))).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node_status("yes"), Some(NodeStatus::Completed));
        assert_eq!(run.node_status("no"), Some(NodeStatus::Skipped));
        assert_eq!(run.node_status("no_after"), Some(NodeStatus::Skipped));
        assert_eq!(run.node_results["check"].selected_handle.as_deref(), Some("true"));
        assert_eq!(run.node_results["yes"].output, Some(json!("big")));
    }

    #[tokio::test]
    async fn merge_node_waits_for_all_predecessors() {
        let wf = workflow(
            vec![
                Node::new("start", NodeType::ManualTrigger, json!({})),
                transform("a", "return input.n + 1"),
                transform("b", "return input.n * 10"),
                transform("join", "return input.a + input.b"),
            ],
            vec![
                Edge::new("start", "a"),
                Edge::new("start", "b"),
                Edge::new("a", "join"),
                Edge::new("b", "join"),
            ],
        );

        let run = engine().await.execute(wf, RunRequest::manual(json!({ "n": 2 }))).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node_results["join"].output, Some(json!(23)));
    }

    #[tokio::test]
    async fn abort_policy_cancels_the_rest_of_the_run() {
        let wf = workflow(
            vec![
                Node::new("start", NodeType::ManualTrigger, json!({})),
                transform("boom", "error('bad input')"),
                transform("after", "return 1"),
            ],
            vec![Edge::new("start", "boom"), Edge::new("boom", "after")],
        );

        let run = engine().await.execute(wf, RunRequest::manual(json!({}))).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.node_status("boom"), Some(NodeStatus::Failed));
        assert_eq!(run.node_status("after"), Some(NodeStatus::Canceled));
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::NodeExecution));
    }

    #[tokio::test]
    async fn isolate_policy_lets_independent_branches_finish() {
        let wf = workflow(
            vec![
                Node::new("start", NodeType::ManualTrigger, json!({})),
                transform("bad", "error('nope')").with_policy(FailurePolicy::Isolate),
                transform("bad_child", "return 1"),
                transform("good", "return 2"),
                transform("good_child", "return input + 1"),
            ],
            vec![
                Edge::new("start", "bad"),
                Edge::new("bad", "bad_child"),
                Edge::new("start", "good"),
                Edge::new("good", "good_child"),
            ],
        );

        let run = engine().await.execute(wf, RunRequest::manual(json!({}))).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.node_status("good_child"), Some(NodeStatus::Completed));
        assert_eq!(run.node_results["good_child"].output, Some(json!(3)));
        assert_eq!(run.node_status("bad_child"), Some(NodeStatus::Skipped));
        assert_eq!(run.node_results["bad_child"].error.as_ref().map(|e| e.kind), Some(ErrorKind::UpstreamFailed));
    }

    #[tokio::test]
    async fn node_timeout_fails_the_node() {
        let (engine, _) = engine_with(SlowClient::new(2_000), EngineConfig::default()).await;
        let wf = workflow(
            vec![Node::new("start", NodeType::ManualTrigger, json!({})), http("slow").with_timeout_ms(50)],
            vec![Edge::new("start", "slow")],
        );

        let run = engine.execute(wf, RunRequest::manual(json!({}))).await.unwrap();
        assert_eq!(run.node_status("slow"), Some(NodeStatus::Failed));
        assert_eq!(run.node_results["slow"].error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn run_timeout_cancels_in_flight_nodes_and_keeps_finished_ones() {
        let (engine, _) = engine_with(SlowClient::new(5_000), EngineConfig::default()).await;
        let wf = workflow(
            vec![
                Node::new("start", NodeType::ManualTrigger, json!({})),
                transform("fast", "return 1"),
                http("slow"),
            ],
            vec![Edge::new("start", "fast"), Edge::new("fast", "slow")],
        );
        let request = RunRequest { run_timeout_ms: Some(300), ..RunRequest::manual(json!({})) };

        let run = engine.execute(wf, request).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
        assert_eq!(run.node_status("fast"), Some(NodeStatus::Completed));
        assert_eq!(run.node_status("slow"), Some(NodeStatus::Canceled));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let client = SlowClient::new(50);
        let config = EngineConfig { max_concurrency: 2, ..EngineConfig::default() };
        let (engine, _) = engine_with(client.clone(), config).await;
        let mut nodes = vec![Node::new("start", NodeType::ManualTrigger, json!({}))];
        let mut edges = Vec::new();
        for i in 0..5 {
            let id = format!("call{}", i);
            nodes.push(http(&id));
            edges.push(Edge::new("start", id));
        }

        let run = engine.execute(workflow(nodes, edges), RunRequest::manual(json!({}))).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_marks_unfinished_nodes_canceled() {
        let (engine, mut events) = {
            let (engine, publisher) = engine_with(SlowClient::new(5_000), EngineConfig::default()).await;
            let rx = publisher.subscribe();
            (engine, rx)
        };
        let wf = workflow(
            vec![Node::new("start", NodeType::ManualTrigger, json!({})), http("slow"), transform("after", "return 1")],
            vec![Edge::new("start", "slow"), Edge::new("slow", "after")],
        );

        let pending = engine.run(wf, RunRequest::manual(json!({}))).await.unwrap();
        assert_eq!(pending.status, RunStatus::Pending);

        // Wait until the slow node is in flight
        loop {
            if let ExecutionEvent::NodeStatusChanged { node_id, status: NodeStatus::Running, .. } = events.recv().await.unwrap() {
                if node_id == "slow" {
                    break;
                }
            }
        }
        assert!(engine.cancel(&pending.id));

        let finished = loop {
            if let ExecutionEvent::RunFinished { status, .. } = events.recv().await.unwrap() {
                break status;
            }
        };
        assert_eq!(finished, RunStatus::Canceled);

        let run = engine.get(&pending.id).await.unwrap().unwrap();
        assert_eq!(run.node_status("slow"), Some(NodeStatus::Canceled));
        assert_eq!(run.node_status("after"), Some(NodeStatus::Canceled));
        assert!(!engine.cancel(&pending.id));
    }

    #[tokio::test]
    async fn start_trigger_skips_other_triggers() {
        let wf = workflow(
            vec![
                Node::new("hook", NodeType::Webhook, json!({ "token": "t" })),
                Node::new("cron", NodeType::CronTrigger, json!({ "schedule": "0 * * * * *" })),
                transform("from_hook", "return input.via"),
                transform("from_cron", "return 'cron'"),
            ],
            vec![Edge::new("hook", "from_hook"), Edge::new("cron", "from_cron")],
        );
        let request = RunRequest::from_trigger(crate::workflow::types::TriggerSource::Webhook, "hook", json!({ "via": "webhook" }));

        let run = engine().await.execute(wf, request).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.node_status("cron"), Some(NodeStatus::Skipped));
        assert_eq!(run.node_status("from_cron"), Some(NodeStatus::Skipped));
        assert_eq!(run.node_results["from_hook"].output, Some(json!("webhook")));
    }

    #[tokio::test]
    async fn cyclic_workflows_are_rejected_before_a_run_exists() {
        let engine = engine().await;
        let wf = workflow(
            vec![transform("a", "return 1"), transform("b", "return 2")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
        );

        let err = engine.execute(wf, RunRequest::manual(json!({}))).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.list("wf-test", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_node_task_fails_its_node() {
        let engine = engine().await;
        let lone = transform("lone", "return 1").with_policy(FailurePolicy::Isolate);
        let wf = workflow(vec![lone, transform("after", "return input")], vec![Edge::new("lone", "after")]);

        let mut driver = engine.prepare(wf, RunRequest::manual(json!({}))).await.unwrap();
        driver.seed().await;
        let index = driver.ready.pop_front().unwrap();

        let mut tasks = JoinSet::new();
        driver.spawn_node(&mut tasks, index).await;
        // Aborted before its first poll, so the task never reports a result
        tasks.abort_all();
        let join_err = match tasks.join_next_with_id().await.unwrap() {
            Err(join_err) => join_err,
            Ok(_) => panic!("aborted task reported a result"),
        };

        assert!(driver.task_lost(join_err).await.is_none());
        assert!(driver.in_flight.is_empty());
        assert!(driver.task_nodes.is_empty());
        assert_eq!(driver.run.node_status("lone"), Some(NodeStatus::Failed));
        assert_eq!(driver.run.node_status("after"), Some(NodeStatus::Skipped));

        driver.settle_run();
        assert_eq!(driver.run.status, RunStatus::Failed);
    }
}
