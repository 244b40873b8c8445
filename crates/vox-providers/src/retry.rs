//! Bounded-backoff retry for provider HTTP calls.
//!
//! Policy per the error-handling design: retry transient failures inside the
//! adapter, then surface `Unavailable` to the turn engine, which degrades
//! rather than aborting the session.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::provider::ProviderError;

pub const DEFAULT_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(4);

/// Run `op` up to `attempts` times, sleeping with doubled, jittered delays
/// between retryable failures. Non-retryable errors pass through untouched;
/// exhaustion converts the last error into `Unavailable`.
pub async fn with_retries<T, F, Fut>(
    provider: &str,
    attempts: u32,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut delay = BASE_DELAY;
    let mut last_err = None;

    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(provider, attempt, "transient provider failure: {e}");
                // Rate-limit replies carry their own delay hint.
                let wait = match &e {
                    ProviderError::RateLimited { retry_after_ms } => {
                        Duration::from_millis(*retry_after_ms).min(MAX_DELAY)
                    }
                    _ => delay,
                };
                last_err = Some(e);
                if attempt < attempts {
                    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
                    tokio::time::sleep(wait + jitter).await;
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }
    }

    Err(ProviderError::Unavailable(format!(
        "{provider}: retries exhausted: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let out = with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(42) }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_unavailable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProviderError::Api {
                    status: 503,
                    message: "down".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_pass_through_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Misconfigured("no api key".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Misconfigured(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
