/// Secure Sandbox
///
/// Executes untrusted transform code with no host capabilities and hard
/// time/memory ceilings. The contract is the `Sandbox` trait; `LuaSandbox`
/// implements it on an embedded, stripped-down Lua 5.4 VM.
/// - `analyzer`: static pre-flight checks
/// - `lua`: isolated runtime with limits
/// - `sanitize`: boundary value cleaning
/// - `audit`: append-only execution audit log

pub mod analyzer;
pub mod audit;
pub mod lua;
pub mod sanitize;

use crate::config::SandboxConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use analyzer::{Severity, Violation, ViolationCategory};
pub use audit::{AuditEntry, AuditLog, AuditOutcome, AuditRecord};
pub use lua::LuaSandbox;

/// Resource ceilings for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: usize,
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            memory_limit_mb: config.memory_limit_mb,
        }
    }
}

/// Values visible to the code, passed by value
#[derive(Debug, Clone, Default)]
pub struct SandboxContext {
    /// Exposed as the `input` global
    pub input: Value,
    /// Exposed as the `vars` global
    pub variables: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    SecurityViolation,
    Timeout,
    MemoryLimit,
    SyntaxError,
    RuntimeError,
    InvalidOutput,
    Internal,
}

/// Classified failure; `message` never contains source code or tracebacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxError {
    pub kind: SandboxErrorKind,
    pub message: String,
}

impl SandboxError {
    pub fn new(kind: SandboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(SandboxErrorKind::Timeout, format!("execution exceeded {}ms", timeout_ms))
    }

    pub fn memory(limit_mb: usize) -> Self {
        Self::new(SandboxErrorKind::MemoryLimit, format!("execution exceeded {}MB memory limit", limit_mb))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxError>,
    pub execution_time_ms: u64,
    pub security_violations: Vec<Violation>,
}

impl SandboxExecutionResult {
    /// True when static analysis refused to run the code at all
    pub fn was_refused(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| e.kind == SandboxErrorKind::SecurityViolation)
            .unwrap_or(false)
            && self.security_violations.iter().any(Violation::is_critical)
    }
}

/// Capability-scoped execution environment for user code
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `code` against `context` within `limits`
    async fn execute(&self, code: &str, context: SandboxContext, limits: SandboxLimits) -> SandboxExecutionResult;

    /// Static check without execution
    fn analyze(&self, code: &str) -> Vec<Violation>;

    fn default_limits(&self) -> SandboxLimits;
}
