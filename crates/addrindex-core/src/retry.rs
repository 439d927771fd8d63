//! Exponential backoff retry policy with jitter and an optional budget.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add ±`jitter_fraction * backoff` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
    /// Total attempts allowed, first try included. `None` = unbounded.
    pub max_attempts: Option<u32>,
    /// Total time budget across attempts. `None` = unbounded.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
            max_attempts: None,
            max_elapsed_ms: None,
        }
    }
}

/// Computes backoff delays and drives retry loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the `attempt`-th retry (1-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter_fraction;
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }

    /// Returns `true` once `attempts` or `elapsed` reaches the budget.
    pub fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        let by_attempts = self.config.max_attempts.is_some_and(|max| attempts >= max);
        let by_time = self
            .config
            .max_elapsed_ms
            .is_some_and(|max| elapsed >= Duration::from_millis(max));
        by_attempts || by_time
    }

    /// Run `op` until it succeeds, fails with an error `is_retryable` rejects,
    /// exhausts the budget (`Timeout`), or `cancel` fires (`Aborted`).
    ///
    /// Cancellation is observed between attempts; an attempt already in
    /// flight runs to completion.
    pub async fn run<T, F, Fut, P>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
        P: Fn(&IndexerError) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(aborted(what));
            }
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => e,
            };

            let elapsed = started.elapsed();
            if self.exhausted(attempt, elapsed) {
                tracing::error!(what, attempt, error = %err, "retry budget exhausted");
                return Err(IndexerError::Timeout {
                    attempts: attempt,
                    elapsed_ms: elapsed.as_millis() as u64,
                    last_error: err.to_string(),
                });
            }

            let delay = self.delay(attempt);
            if err.is_transient() {
                tracing::warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "node unreachable, is it running? retrying"
                );
            } else {
                tracing::debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(aborted(what)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn aborted(what: &str) -> IndexerError {
    IndexerError::Aborted {
        reason: format!("{what}: cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2.0,
            jitter_fraction: 0.0,
            max_attempts,
            max_elapsed_ms: None,
        })
    }

    #[test]
    fn delays_double_then_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        });
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(20), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(1).as_millis();
            assert!((900..=1100).contains(&d), "delay {d}ms outside ±10%");
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast(None)
            .run("op", &CancellationToken::new(), IndexerError::is_transient, move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IndexerError::Connectivity("connection not open".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast(None)
            .run("op", &CancellationToken::new(), IndexerError::is_transient, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::Rpc("bad request".into()))
            })
            .await;
        assert!(matches!(result, Err(IndexerError::Rpc(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_raises_timeout() {
        let result: Result<(), _> = fast(Some(3))
            .run("op", &CancellationToken::new(), IndexerError::is_transient, || async {
                Err(IndexerError::Connectivity("down".into()))
            })
            .await;
        match result {
            Err(IndexerError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_between_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = fast(None)
            .run("op", &cancel, IndexerError::is_transient, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(IndexerError::Aborted { .. })));
    }
}
