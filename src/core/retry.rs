// src/core/retry.rs

//! A DCS call "MAY fail with a transient error; the caller retries with an
//! exponential-backoff budget bounded by `retry_timeout`, and on exhaustion
//! treats the operation as failed rather than fatal to the loop" (the same
//! shape `SupervisorError::RetryFailed` exists for). The backoff-with-jitter
//! itself follows the replication reconnect loop's pattern of doubling the
//! delay and adding a small random jitter to avoid a thundering herd
//! (`core/replication/worker.rs`), adapted here to a budget rather than an
//! unbounded retry loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

use crate::core::errors::SupervisorError;

const INITIAL_DELAY: Duration = Duration::from_millis(50);
const MAX_DELAY: Duration = Duration::from_secs(2);
const JITTER_MAX_MS: u64 = 100;

/// Retries `op` with exponential backoff until it succeeds or `budget` has
/// elapsed, at which point the last error is surfaced as `RetryFailed`.
pub async fn retry_with_backoff<T, E, F, Fut>(budget: Duration, mut op: F) -> Result<T, SupervisorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let deadline = Instant::now() + budget;
    let mut delay = INITIAL_DELAY;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SupervisorError::RetryFailed(e.to_string()));
                }
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MAX_MS));
                let remaining = deadline - now;
                let wait = (delay + jitter).min(remaining);
                warn!(error = %e, wait = ?wait, "transient failure, retrying");
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_immediately_without_retrying() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(Duration::from_secs(5), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn exhausting_the_budget_surfaces_retry_failed() {
        let result: Result<(), SupervisorError> =
            retry_with_backoff(Duration::from_millis(120), || async { Err::<(), _>("down") }).await;
        assert!(matches!(result, Err(SupervisorError::RetryFailed(_))));
    }
}
