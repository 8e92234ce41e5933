//! Shared retry policy
//!
//! One bounded exponential backoff used by the RPC client, the download
//! coordinator, the supervisor and the upload step. Callers decide which errors
//! are worth another attempt through a predicate.

use relay_daemon_config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A wait or retry loop was interrupted by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

/// Successful result plus how many attempts it took.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Constant delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, delay, 1.0, delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after the given failed attempt (1-based), capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Run `operation` until it succeeds, the error is not retryable, or the
    /// attempt budget is spent. The operation receives the 1-based attempt number.
    pub async fn run<F, Fut, T, E, P>(
        &self,
        label: &str,
        is_retryable: P,
        operation: F,
    ) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        self.attempts(label, is_retryable, operation, |delay| async move {
            sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Like [`RetryPolicy::run`], but `cancel` is checked before every attempt,
    /// races the attempt itself and cuts every backoff short.
    pub async fn run_cancellable<F, Fut, T, E, P>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        is_retryable: P,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + From<Cancelled>,
        P: Fn(&E) -> bool,
    {
        let guarded = |attempt| {
            let call = operation(attempt);
            async move {
                if cancel.is_cancelled() {
                    return Err(E::from(Cancelled));
                }
                tokio::select! {
                    _ = cancel.cancelled() => Err(E::from(Cancelled)),
                    result = call => result,
                }
            }
        };
        self.attempts(label, is_retryable, guarded, |delay| async move {
            sleep_or_cancel(delay, cancel).await.map_err(E::from)
        })
        .await
    }

    async fn attempts<F, Fut, T, E, P, W, WFut>(
        &self,
        label: &str,
        is_retryable: P,
        mut operation: F,
        mut wait: W,
    ) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
        W: FnMut(Duration) -> WFut,
        WFut: Future<Output = Result<(), E>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                    })
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying operation"
                    );
                    if !delay.is_zero() {
                        wait(delay).await?;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
