//! Bounded retry with exponential backoff for transient I/O failures
use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::AppResult;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add ±30% random jitter to each wait
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Runs `f` until it succeeds, fails permanently, or the budget runs out
///
/// Only errors for which [`AppError::is_transient`](crate::error::AppError::is_transient)
/// holds are retried. The last error is returned unchanged.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::warn!(
                        operation,
                        max_retries = config.max_retries,
                        error = %e,
                        "Retry budget exhausted"
                    );
                    return Err(e);
                }

                let delay = calculate_backoff(backoff, config.jitter);

                tracing::warn!(
                    operation,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Transient failure, retrying"
                );

                tokio::time::sleep(delay).await;

                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(config.max_backoff.as_millis() as f64)) as u64,
                );
            }
        }
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}
