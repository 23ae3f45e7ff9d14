/// Runtime Execution Engine
///
/// This module provides the petgraph-based DAG orchestrator and its node executors.
/// It handles:
/// - Ready-queue scheduling with bounded concurrency
/// - Branch selection, skip cascades and failure policies
/// - Node and run timeouts, cancellation
/// - Status events for every transition

// Core execution engine using petgraph for DAG processing
pub mod engine;

// Node execution contract and executor registry
pub mod executor;

// Branching on pin expressions
pub mod condition;

// Sandboxed Lua transforms
pub mod transform;

// HTTP and agent calls with retry
pub mod external;

// Run and node status events
pub mod events;

// Re-export main types
pub use engine::ExecutionEngine;
pub use events::{BroadcastPublisher, EventPublisher, ExecutionEvent};
pub use executor::{ExecutorSet, NodeContext, NodeExecutor, NodeOutcome};
pub use external::{ExternalClient, HttpExternalClient};
