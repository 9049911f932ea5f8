//! Bounded exponential backoff with cancellation
//!
//! Used for opening agent transports. Every sleep races the cancellation
//! token so a disconnect never waits out a backoff.

use std::future::Future;
use std::time::Duration;

use companion_connector::ConnectorError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for ConnectorError {
    fn is_retryable(&self) -> bool {
        ConnectorError::is_retryable(self)
    }
}

/// How a retried operation ended without success
#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    /// The last error, after `attempts` tries.
    Exhausted { attempts: u32, error: E },
    Fatal(E),
}

pub(crate) fn calculate_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exponential_delay = cfg.base_delay.as_secs_f64() * cfg.backoff_factor.powi(attempt as i32);
    let capped_delay = exponential_delay.min(cfg.max_delay.as_secs_f64());

    let final_delay = if cfg.jitter {
        let jitter_factor = 0.5 + fastrand::f64();
        capped_delay * jitter_factor
    } else {
        capped_delay
    };

    Duration::from_secs_f64(final_delay)
}

pub async fn retry<F, Fut, T, E>(
    cfg: &RetryConfig,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = cfg.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = f() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;

        if !err.is_retryable() {
            warn!(
                component = "retry",
                event = "retry.fatal",
                error = %err,
                attempt = attempt,
                "Non-retryable error encountered"
            );
            return Err(RetryError::Fatal(err));
        }

        if attempt >= max_attempts {
            warn!(
                component = "retry",
                event = "retry.exhausted",
                error = %err,
                attempt = attempt,
                max_attempts = max_attempts,
                "Max retry attempts exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                error: err,
            });
        }

        let delay = calculate_delay(cfg, attempt - 1);
        warn!(
            component = "retry",
            event = "retry.backoff",
            error = %err,
            attempt = attempt,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying after error"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct MockError {
        retryable: bool,
    }

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "mock error (retryable: {})", self.retryable)
        }
    }

    impl RetryableError for MockError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = retry(&fast_config(5), &CancellationToken::new(), || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(MockError { retryable: false })
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_error_stops_at_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = retry(&fast_config(3), &CancellationToken::new(), || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(MockError { retryable: true })
            }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = retry(&fast_config(5), &CancellationToken::new(), || {
            let count = Arc::clone(&counter);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MockError { retryable: true })
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert!(matches!(result, Ok("connected")));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cfg = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.0,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> = retry(&cfg, &cancel, || async {
            Err(MockError { retryable: true })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn jitter_adds_randomness() {
        let with_jitter = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
            ..fast_config(3)
        };
        let without_jitter = RetryConfig {
            jitter: false,
            ..with_jitter.clone()
        };

        let fixed: Vec<Duration> = (0..10).map(|_| calculate_delay(&without_jitter, 1)).collect();
        assert!(fixed.windows(2).all(|w| w[0] == w[1]));

        let varied: Vec<Duration> = (0..10).map(|_| calculate_delay(&with_jitter, 1)).collect();
        assert!(!varied.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn delay_respects_max_delay() {
        let cfg = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 10.0,
            jitter: false,
        };
        for attempt in 0..10 {
            assert!(calculate_delay(&cfg, attempt) <= Duration::from_secs(5));
        }
    }
}
