//! Waiting out a locked VM config.
//!
//! While a clone (or backup, migration, …) is running the API reports the
//! config with a `lock` field, e.g.
//! `{"lock":"clone","digest":"eb54…","description":"qmclone temporary file\n"}`.
//! Reads are retried under a [`RetryPolicy`] until the field disappears.

use crate::error::{ProxmoxError, ProxmoxResult};
use crate::types::FlatConfig;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// Always wait `initial_backoff_ms`.
    Fixed,
    /// Double the delay each attempt, capped at `max_backoff_ms`.
    Exponential,
}

/// Bounds for the lock wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total config reads, including the first (default: 3).
    pub max_attempts: u32,
    pub mode: BackoffMode,
    /// Delay after the first locked read in milliseconds (default: 8000).
    pub initial_backoff_ms: u64,
    /// Cap for exponential growth in milliseconds (default: 60_000).
    pub max_backoff_ms: u64,
    /// Give up once this much time would be exceeded by the next sleep.
    pub deadline_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            mode: BackoffMode::Fixed,
            initial_backoff_ms: 8_000,
            max_backoff_ms: 60_000,
            deadline_secs: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the zero-based `attempt` found the config locked.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = match self.mode {
            BackoffMode::Fixed => self.initial_backoff_ms,
            BackoffMode::Exponential => self
                .initial_backoff_ms
                .saturating_mul(2u64.saturating_pow(attempt))
                .min(self.max_backoff_ms),
        };
        Duration::from_millis(ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// The `lock` marker of a config, if set.
pub fn lock_of(config: &FlatConfig) -> Option<String> {
    match config.get("lock") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Call `fetch` until it returns an unlocked config.
///
/// Fetch errors are returned immediately; only the lock is retried.
/// `cancel` is observed during fetches as well as between them.
pub async fn wait_until_unlocked<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut fetch: F,
) -> ProxmoxResult<FlatConfig>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProxmoxResult<FlatConfig>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut last_lock = String::new();

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(ProxmoxError::cancelled(format!("Stopped waiting for {what}")));
        }

        let config = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProxmoxError::cancelled(format!("Stopped waiting for {what}")));
            }
            result = fetch() => result?,
        };
        match lock_of(&config) {
            None => {
                debug!("{what} unlocked after {} attempt(s)", attempt + 1);
                return Ok(config);
            }
            Some(lock) => last_lock = lock,
        }

        if attempt + 1 == max_attempts {
            break;
        }

        let delay = policy.delay_for(attempt);
        if let Some(deadline) = policy.deadline() {
            if started.elapsed() + delay > deadline {
                return Err(ProxmoxError::locked(format!(
                    "{what} still locked ({last_lock}) at the {}s deadline",
                    deadline.as_secs()
                )));
            }
        }

        warn!(
            "{what} is locked ({last_lock}) (attempt {}/{}) - retrying in {}ms",
            attempt + 1,
            max_attempts,
            delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProxmoxError::cancelled(format!("Stopped waiting for {what}")));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Err(ProxmoxError::locked(format!(
        "{what} still locked ({last_lock}) after {max_attempts} attempts, could not obtain config"
    )))
}
