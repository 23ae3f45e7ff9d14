/// Workflow Management Layer
///
/// Graph model, validation and the hot-reload registry:
/// - Type definitions (Workflow, Node, Edge, ExecutionRun, NodeResult)
/// - Petgraph compilation with cycle and reference checks
/// - Lock-free hot-reload registry using ArcSwap

// Core workflow and run type definitions
pub mod types;

// Petgraph DAG compilation and validation
pub mod graph;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use graph::{validate_workflow, WorkflowGraph};
pub use types::{
    Edge, ExecutionRun, FailurePolicy, Node, NodeResult, NodeStatus, NodeType, RunRequest,
    RunStatus, TriggerSource, Workflow, WorkflowStatus,
};
