/// Sliding-window admission guard
///
/// Decides per key (e.g. `webhook:<token>`) whether a new run may start. Every
/// key is checked against several windows, tightest first; the first denying
/// window short-circuits. Only admitted attempts are recorded, and they are
/// recorded in every window in one atomic step inside the store.

pub mod store;

use crate::config::{FallbackPolicy, RateLimitConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use store::{LocalWindowStore, SqliteWindowStore, WindowStore};

pub const MINUTE_MS: u64 = 60_000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// At most `limit` admissions in any `window_ms` span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub window_ms: u64,
    pub limit: u32,
}

impl WindowLimit {
    pub fn new(window_ms: u64, limit: u32) -> Self {
        Self { window_ms, limit }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(MINUTE_MS, limit)
    }

    pub fn per_hour(limit: u32) -> Self {
        Self::new(HOUR_MS, limit)
    }

    pub fn per_day(limit: u32) -> Self {
        Self::new(DAY_MS, limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Allowed,
    Denied {
        /// The window that refused admission
        window_ms: u64,
        retry_after_ms: u64,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RateLimitError {
    #[error("admission store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Pruned state of one window at decision time
#[derive(Debug, Clone, Copy)]
pub struct WindowState {
    pub limit: WindowLimit,
    pub count: usize,
    pub oldest_ms: Option<i64>,
}

/// Sort windows tightest to loosest and drop duplicates
pub fn normalize_limits(limits: &[WindowLimit]) -> Vec<WindowLimit> {
    let mut sorted = limits.to_vec();
    sorted.sort_by_key(|l| (l.window_ms, l.limit));
    sorted.dedup_by_key(|l| l.window_ms);
    sorted
}

/// Timestamps older than this are outside the window
pub fn window_floor(now_ms: i64, window_ms: u64) -> i64 {
    now_ms.saturating_sub(window_ms as i64)
}

/// Decide admission for one window; `None` means this window admits
pub fn evaluate_window(state: &WindowState, now_ms: i64) -> Option<Admission> {
    if state.count < state.limit.limit as usize {
        return None;
    }
    let window = state.limit.window_ms as i64;
    let retry_after_ms = match state.oldest_ms {
        Some(oldest) => (oldest + window - now_ms).max(1) as u64,
        None => state.limit.window_ms.max(1),
    };
    Some(Admission::Denied {
        window_ms: state.limit.window_ms,
        retry_after_ms,
    })
}

/// Admission guard with a shared store and a fallback policy
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    fallback: FallbackPolicy,
    local: LocalWindowStore,
    defaults: Vec<WindowLimit>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            fallback: config.fallback,
            local: LocalWindowStore::new(),
            defaults: limits_from_config(config),
        }
    }

    /// Process-local guard, used in tests and single-instance setups
    pub fn local(config: &RateLimitConfig) -> Self {
        Self::new(Arc::new(LocalWindowStore::new()), config)
    }

    /// Limits applied when a trigger carries no `rate_limit` block
    pub fn default_limits(&self) -> &[WindowLimit] {
        &self.defaults
    }

    pub async fn check(&self, key: &str, limits: &[WindowLimit]) -> Result<Admission, RateLimitError> {
        self.check_at(key, limits, chrono::Utc::now().timestamp_millis()).await
    }

    /// Check and, when admitted, record an attempt at `now_ms`
    pub async fn check_at(&self, key: &str, limits: &[WindowLimit], now_ms: i64) -> Result<Admission, RateLimitError> {
        let limits = normalize_limits(limits);
        if limits.is_empty() {
            return Ok(Admission::Allowed);
        }

        let decision = match self.store.check_and_record(key, &limits, now_ms).await {
            Ok(decision) => decision,
            Err(err) => match self.fallback {
                FallbackPolicy::FailClosed => {
                    tracing::error!("🚧 Admission store unavailable, refusing '{}': {}", key, err);
                    return Err(err);
                }
                FallbackPolicy::LocalApproximation => {
                    tracing::warn!("⚠️ Admission store unavailable, using process-local counts for '{}': {}", key, err);
                    self.local.check_and_record(key, &limits, now_ms).await?
                }
            },
        };

        if let Admission::Denied { window_ms, retry_after_ms } = decision {
            tracing::warn!("🚦 Admission denied for '{}' ({}ms window, retry after {}ms)",
                key, window_ms, retry_after_ms);
        }
        Ok(decision)
    }
}

/// Configured default windows
pub fn limits_from_config(config: &RateLimitConfig) -> Vec<WindowLimit> {
    let mut limits = Vec::new();
    if let Some(n) = config.per_minute {
        limits.push(WindowLimit::per_minute(n));
    }
    if let Some(n) = config.per_hour {
        limits.push(WindowLimit::per_hour(n));
    }
    if let Some(n) = config.per_day {
        limits.push(WindowLimit::per_day(n));
    }
    limits
}

/// Windows from a trigger node's `rate_limit` config block
///
/// `{"per_minute": 10, "per_hour": 100, "per_day": 1000}`; any subset. Returns
/// `None` when the block is absent so callers fall back to the defaults.
pub fn limits_from_node_config(config: &Value) -> Option<Vec<WindowLimit>> {
    let block = config.get("rate_limit")?.as_object()?;
    let read = |name: &str| block.get(name).and_then(Value::as_u64).map(|n| n.min(u32::MAX as u64) as u32);

    let mut limits = Vec::new();
    if let Some(n) = read("per_minute") {
        limits.push(WindowLimit::per_minute(n));
    }
    if let Some(n) = read("per_hour") {
        limits.push(WindowLimit::per_hour(n));
    }
    if let Some(n) = read("per_day") {
        limits.push(WindowLimit::per_day(n));
    }
    Some(limits)
}
