/// Engine error taxonomy
///
/// Every failure the engine surfaces falls into one of these classes. The class
/// decides how it propagates: validation errors reject a run before it exists,
/// node errors follow the node's failure policy, security violations are never
/// retried, timeouts are terminal for their scope, and transient integration
/// errors may be retried only at the external-call boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Scope a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Node,
    Run,
    Sandbox,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Node => write!(f, "node"),
            TimeoutScope::Run => write!(f, "run"),
            TimeoutScope::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// Errors produced while validating or executing a workflow
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Malformed graph, cycle, unknown node type or reference
    #[error("validation error: {0}")]
    Validation(String),

    /// An executor's business logic failed
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// Sandbox static or runtime violation, message already sanitized
    #[error("security violation ({category}): {reason}")]
    SecurityViolation { category: String, reason: String },

    #[error("{scope} timed out after {timeout_ms}ms")]
    Timeout { scope: TimeoutScope, timeout_ms: u64 },

    /// Downstream failure that may succeed on retry (rate limits, 5xx, connect errors)
    #[error("transient integration error: {0}")]
    TransientIntegration(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Serializable classification stored alongside node and run errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NodeExecution,
    SecurityViolation,
    Timeout,
    TransientIntegration,
    Canceled,
    Storage,
    UpstreamFailed,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NodeExecution { .. } => ErrorKind::NodeExecution,
            EngineError::SecurityViolation { .. } => ErrorKind::SecurityViolation,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::TransientIntegration(_) => ErrorKind::TransientIntegration,
            EngineError::Canceled(_) => ErrorKind::Canceled,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only transient integration failures are eligible for retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientIntegration(_))
    }

    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Classified error recorded on a node result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for NodeError {
    fn from(err: &EngineError) -> Self {
        NodeError::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(EngineError::TransientIntegration("429".into()).is_retryable());
        assert!(!EngineError::Timeout { scope: TimeoutScope::Node, timeout_ms: 10 }.is_retryable());
        assert!(!EngineError::SecurityViolation {
            category: "filesystem".into(),
            reason: "io access".into()
        }
        .is_retryable());
    }

    #[test]
    fn node_error_keeps_classification() {
        let err = EngineError::Timeout { scope: TimeoutScope::Run, timeout_ms: 500 };
        let node_err = NodeError::from(&err);
        assert_eq!(node_err.kind, ErrorKind::Timeout);
        assert_eq!(node_err.message, "run timed out after 500ms");
    }
}
