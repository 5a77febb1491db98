use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Run a fallible async operation, retrying on error.
///
/// Calls `f` up to `max_attempts` times (at least once). Between attempts,
/// waits `base_delay * attempt`. `should_retry` decides whether an error is
/// worth another attempt; a `false` return gives up immediately.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    should_retry: R,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    label, attempt, max_attempts, e
                );
                tokio::time::sleep(base_delay * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("{} failed after {} attempt(s): {}", label, attempt, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_one_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> =
            retry_with_backoff(2, Duration::ZERO, "flaky", |_| true, move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err("first".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> =
            retry_with_backoff(2, Duration::ZERO, "broken", |_| true, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> =
            retry_with_backoff(5, Duration::ZERO, "fatal", |_| false, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
