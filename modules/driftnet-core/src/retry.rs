//! Retry executor — classification-gated retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use driftnet_common::DomainContext;
use rand::Rng;
use tracing::warn;

use crate::classify::{classify, RecoveryAction};

/// Run `op`, retrying only failures the classifier marks `Retry`.
///
/// Any other action (`AbortTask`, `SkipItem`, `GracefulDegrade`) re-raises
/// immediately with the error unchanged — burning attempts on a failure that
/// will not heal wastes quota. Backoff is `base * 2^attempt` plus 0–1000ms of
/// uniform jitter so concurrently running sessions do not retry in lockstep.
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    max_attempts: u32,
    base_delay: Duration,
    context: Option<DomainContext>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    debug_assert!(max_attempts > 0);

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let classification = classify(&err, context);
                if classification.action != RecoveryAction::Retry {
                    return Err(err);
                }
                if attempt + 1 >= max_attempts {
                    return Err(err);
                }

                let base = classification.backoff_base.unwrap_or(base_delay);
                let backoff = base * 2u32.pow(attempt);
                let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("note not found")
            },
            5,
            Duration::from_millis(10),
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn systemic_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("session invalidated")
            },
            5,
            Duration::from_millis(10),
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_error_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    anyhow::bail!("connection refused")
                }
                Ok(n)
            },
            5,
            Duration::from_millis(10),
            None,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_reraise_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("request timeout")
            },
            3,
            Duration::from_millis(10),
            None,
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
