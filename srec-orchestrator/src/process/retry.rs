//! Retry policy shared by capture and remux.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Error kinds a [`RetryPolicy`] may be configured to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    TransientCapture,
    FilesystemConflict,
    ContainerRepair,
}

impl RetryableKind {
    pub fn of(error: &Error) -> Option<Self> {
        match error {
            Error::TransientCapture(_) => Some(Self::TransientCapture),
            Error::FilesystemConflict { .. } => Some(Self::FilesystemConflict),
            Error::ContainerRepair(_) => Some(Self::ContainerRepair),
            _ => None,
        }
    }
}

/// Exponential backoff policy.
///
/// `max_attempts` counts the first try, so the default of 3 means one
/// initial attempt plus two retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub use_jitter: bool,
    /// Which error kinds qualify for another attempt.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<RetryableKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_retry_on() -> Vec<RetryableKind> {
    vec![RetryableKind::TransientCapture]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: default_true(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    /// Policy used by the remux pipeline to re-run a strategy after cleaning
    /// up a conflicting output file. No backoff.
    pub fn same_strategy() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            use_jitter: false,
            retry_on: vec![RetryableKind::FilesystemConflict],
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        let delay_ms = base.min(self.max_delay_ms as f64) as u64;

        if self.use_jitter && delay_ms > 0 {
            // Add up to 25% jitter
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    pub fn qualifies(&self, error: &Error) -> bool {
        RetryableKind::of(error).is_some_and(|kind| self.retry_on.contains(&kind))
    }

    /// Run `op` until it succeeds, fails with a non-qualifying error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    ///
    /// Cancellation during a backoff sleep returns [`Error::Cancelled`].
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.qualifies(&e) && self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
