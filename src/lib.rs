/// flowgate: directed-graph workflow runner
///
/// Executes user-authored node graphs (triggers, conditional branches, sandboxed
/// Lua transforms, external and agent calls), tracks per-run and per-node state,
/// streams progress, and gates external triggers with a sliding-window
/// admission guard.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by the engine and its surfaces
pub mod error;

// Workflow management layer - definitions, validation and registry
pub mod workflow;

// Persistence - SQLite workflows, runs, audit and window logs
pub mod store;

// Secure sandbox for transform code
pub mod sandbox;

// Sliding-window admission guard
pub mod ratelimit;

// Runtime execution engine - petgraph DAG execution and node orchestration
pub mod runtime;

// Webhook, schedule and manual triggers
pub mod trigger;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, ErrorKind, NodeError};
pub use runtime::ExecutionEngine;
pub use server::start_server;
pub use workflow::{Edge, ExecutionRun, Node, NodeType, RunStatus, Workflow};
