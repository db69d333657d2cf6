//! Backoff policy shared by the connect phase, the consumer and the sink
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Whether a failed attempt is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

/// Failure of an operation run under a [RetryPolicy]
#[derive(Debug)]
pub enum RetryError<E> {
    /// Classified as non-retryable, returned after the first occurrence
    Fatal(E),
    /// Still retryable, but the attempts ran out
    AttemptsExceeded(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) | RetryError::AttemptsExceeded(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `max_retries` counts repeats after the first attempt
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_retries + 1,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error
    /// or exhausts the attempts, sleeping between attempts.
    pub async fn run<F, Fut, T, E, C>(
        &self,
        what: &str,
        mut op: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match classify(&e) {
                    RetryDisposition::Stop => return Err(RetryError::Fatal(e)),
                    RetryDisposition::Retry => {
                        if attempt + 1 >= self.max_attempts {
                            return Err(RetryError::AttemptsExceeded(e));
                        }
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = self.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "{what} failed: {e}"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(100),
            Duration::from_millis(350),
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(350));
        assert_eq!(p.backoff_delay(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = &AtomicUsize::new(0);
        let res: Result<usize, RetryError<String>> = policy(3)
            .run(
                "op",
                || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(format!("fail {n}"))
                    } else {
                        Ok(n)
                    }
                },
                |_| RetryDisposition::Retry,
            )
            .await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicUsize::new(0);
        let res: Result<(), _> = policy(2)
            .run(
                "op",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                },
                |_| RetryDisposition::Retry,
            )
            .await;
        assert!(matches!(res, Err(RetryError::AttemptsExceeded("down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_fatal() {
        let calls = &AtomicUsize::new(0);
        let res: Result<(), _> = policy(5)
            .run(
                "op",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("bad")
                },
                |_| RetryDisposition::Stop,
            )
            .await;
        assert!(matches!(res, Err(RetryError::Fatal("bad"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
