/// Window log stores for the admission guard
///
/// A store owns the timestamp logs and performs prune, count, decide and record
/// for one key as a single atomic step.

use crate::ratelimit::{evaluate_window, window_floor, Admission, RateLimitError, WindowLimit, WindowState};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Atomic sliding-window check for one key
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// `limits` arrive sorted tightest to loosest
    async fn check_and_record(&self, key: &str, limits: &[WindowLimit], now_ms: i64) -> Result<Admission, RateLimitError>;
}

/// Checks between sweeps of logs whose keys stopped arriving
const SWEEP_EVERY_CHECKS: u64 = 256;

/// Process-local store; limits hold per instance only
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    inner: Mutex<LocalLogs>,
}

#[derive(Debug, Default)]
struct LocalLogs {
    logs: HashMap<(String, u64), VecDeque<i64>>,
    checks: u64,
}

impl LocalLogs {
    /// Prune every log and forget the ones left empty
    fn sweep(&mut self, now_ms: i64) {
        self.logs.retain(|(_, window_ms), log| {
            let floor = window_floor(now_ms, *window_ms);
            while log.front().map(|&ts| ts < floor).unwrap_or(false) {
                log.pop_front();
            }
            !log.is_empty()
        });
    }
}

impl LocalWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of (key, window) logs currently held
    pub fn tracked_logs(&self) -> usize {
        self.inner.lock().map(|inner| inner.logs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn check_and_record(&self, key: &str, limits: &[WindowLimit], now_ms: i64) -> Result<Admission, RateLimitError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| RateLimitError::StoreUnavailable("local window log poisoned".into()))?;

        inner.checks += 1;
        if inner.checks % SWEEP_EVERY_CHECKS == 0 {
            inner.sweep(now_ms);
            tracing::debug!("🧹 Swept local window logs, {} still tracked", inner.logs.len());
        }

        for limit in limits {
            let floor = window_floor(now_ms, limit.window_ms);
            let (count, oldest_ms) = match inner.logs.get_mut(&(key.to_string(), limit.window_ms)) {
                Some(log) => {
                    while log.front().map(|&ts| ts < floor).unwrap_or(false) {
                        log.pop_front();
                    }
                    (log.len(), log.front().copied())
                }
                None => (0, None),
            };
            let state = WindowState {
                limit: *limit,
                count,
                oldest_ms,
            };
            if let Some(denied) = evaluate_window(&state, now_ms) {
                return Ok(denied);
            }
        }

        for limit in limits {
            inner
                .logs
                .entry((key.to_string(), limit.window_ms))
                .or_default()
                .push_back(now_ms);
        }
        Ok(Admission::Allowed)
    }
}

/// Shared store on the `rate_limit_events` table
///
/// Each check runs in one `BEGIN IMMEDIATE` transaction, so concurrent
/// instances on the same database serialize per check. A process-wide async
/// mutex avoids busy retries between tasks of the same instance.
#[derive(Debug)]
pub struct SqliteWindowStore {
    pool: SqlitePool,
    gate: tokio::sync::Mutex<()>,
}

impl SqliteWindowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            gate: tokio::sync::Mutex::new(()),
        }
    }
}

fn unavailable(err: sqlx::Error) -> RateLimitError {
    RateLimitError::StoreUnavailable(err.to_string())
}

async fn check_in_transaction(
    conn: &mut SqliteConnection,
    key: &str,
    limits: &[WindowLimit],
    now_ms: i64,
) -> Result<Admission, sqlx::Error> {
    for limit in limits {
        let window_ms = limit.window_ms as i64;
        sqlx::query("DELETE FROM rate_limit_events WHERE limit_key = ? AND window_ms = ? AND ts_ms < ?")
            .bind(key)
            .bind(window_ms)
            .bind(window_floor(now_ms, limit.window_ms))
            .execute(&mut *conn)
            .await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS count, MIN(ts_ms) AS oldest FROM rate_limit_events WHERE limit_key = ? AND window_ms = ?",
        )
        .bind(key)
        .bind(window_ms)
        .fetch_one(&mut *conn)
        .await?;

        let count: i64 = row.get("count");
        let oldest: Option<i64> = row.get("oldest");
        let state = WindowState {
            limit: *limit,
            count: count.max(0) as usize,
            oldest_ms: oldest,
        };
        if let Some(denied) = evaluate_window(&state, now_ms) {
            return Ok(denied);
        }
    }

    for limit in limits {
        sqlx::query("INSERT INTO rate_limit_events (limit_key, window_ms, ts_ms) VALUES (?, ?, ?)")
            .bind(key)
            .bind(limit.window_ms as i64)
            .bind(now_ms)
            .execute(&mut *conn)
            .await?;
    }
    Ok(Admission::Allowed)
}

#[async_trait]
impl WindowStore for SqliteWindowStore {
    async fn check_and_record(&self, key: &str, limits: &[WindowLimit], now_ms: i64) -> Result<Admission, RateLimitError> {
        let _guard = self.gate.lock().await;
        // An abandoned check drops the transaction, which rolls it back before
        // the connection returns to the pool
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(unavailable)?;
        let decision = match check_in_transaction(&mut *tx, key, limits, now_ms).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!("⚠️ Admission check for '{}' rolled back: {}", key, err);
                return Err(unavailable(err));
            }
        };
        tx.commit().await.map_err(unavailable)?;
        Ok(decision)
    }
}
