/// Configuration management for the flowgate engine
///
/// Handles server, database, orchestrator, sandbox and admission-guard settings.
/// Every value has a default and can be overridden through a FLOWGATE_* env var.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub sandbox: SandboxConfig,
    pub rate_limit: RateLimitConfig,
    pub webhook: WebhookConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. "sqlite://data/flowgate.db"
    pub url: String,
}

/// Orchestrator limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node executions in flight per run
    pub max_concurrency: usize,
    pub default_node_timeout_ms: u64,
    pub run_timeout_ms: u64,
}

/// Default ceilings for sandboxed transform code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub memory_limit_mb: usize,
    /// Longer source is refused before analysis
    pub max_code_bytes: usize,
    /// Strings crossing the boundary are truncated to this many bytes
    pub max_string_bytes: usize,
    pub max_depth: usize,
}

/// What the admission guard does when the shared store is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Deny admission until the shared store is back
    FailClosed,
    /// Count in process memory; limits then hold per instance only
    LocalApproximation,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_closed" | "closed" => Ok(FallbackPolicy::FailClosed),
            "local" | "local_approximation" => Ok(FallbackPolicy::LocalApproximation),
            other => Err(format!("unknown rate limit fallback policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub per_day: Option<u32>,
    pub fallback: FallbackPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Use the first X-Forwarded-For address as the source IP
    pub trust_forwarded_for: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_node_timeout_ms: 30_000,
            run_timeout_ms: 300_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            memory_limit_mb: 128,
            max_code_bytes: 64 * 1024,
            max_string_bytes: 64 * 1024,
            max_depth: 32,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: Some(60),
            per_hour: Some(1_000),
            per_day: Some(10_000),
            fallback: FallbackPolicy::FailClosed,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str, default: Option<T>) -> Option<T> {
    match std::env::var(key) {
        Ok(v) if v.eq_ignore_ascii_case("none") || v.is_empty() => None,
        Ok(v) => v.parse().ok().or(default),
        Err(_) => default,
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let engine = EngineConfig::default();
        let sandbox = SandboxConfig::default();
        let rate_limit = RateLimitConfig::default();

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWGATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWGATE_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWGATE_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowgate.db".to_string()),
            },
            engine: EngineConfig {
                max_concurrency: env_or("FLOWGATE_MAX_CONCURRENCY", engine.max_concurrency).max(1),
                default_node_timeout_ms: env_or("FLOWGATE_NODE_TIMEOUT_MS", engine.default_node_timeout_ms),
                run_timeout_ms: env_or("FLOWGATE_RUN_TIMEOUT_MS", engine.run_timeout_ms),
            },
            sandbox: SandboxConfig {
                timeout_ms: env_or("FLOWGATE_SANDBOX_TIMEOUT_MS", sandbox.timeout_ms),
                memory_limit_mb: env_or("FLOWGATE_SANDBOX_MEMORY_MB", sandbox.memory_limit_mb),
                ..sandbox
            },
            rate_limit: RateLimitConfig {
                per_minute: env_opt("FLOWGATE_RATE_LIMIT_PER_MINUTE", rate_limit.per_minute),
                per_hour: env_opt("FLOWGATE_RATE_LIMIT_PER_HOUR", rate_limit.per_hour),
                per_day: env_opt("FLOWGATE_RATE_LIMIT_PER_DAY", rate_limit.per_day),
                fallback: env_or("FLOWGATE_RATE_LIMIT_FALLBACK", rate_limit.fallback),
            },
            webhook: WebhookConfig {
                trust_forwarded_for: env_or("FLOWGATE_TRUST_FORWARDED_FOR", false),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_policy_parses_aliases() {
        assert_eq!("closed".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::FailClosed);
        assert_eq!("LOCAL".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::LocalApproximation);
        assert!("sometimes".parse::<FallbackPolicy>().is_err());
    }

    #[test]
    fn sandbox_defaults_match_documented_ceilings() {
        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.timeout_ms, 1_000);
        assert_eq!(sandbox.memory_limit_mb, 128);
    }
}
