use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::{AbortHandle, DEFAULT_RECONNECT_MAX_ATTEMPTS, DEFAULT_RECONNECT_MAX_WAIT, DialConfig};
use crate::error::LinkError;

const INITIAL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            initial_delay: INITIAL_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_WAIT,
        }
    }
}

impl RetryPolicy {
    pub fn for_dial(config: &DialConfig) -> Self {
        let max_attempts = if config.no_reconnect {
            1
        } else {
            config
                .reconnect_max_attempts
                .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS)
                .max(1)
        };
        Self {
            max_attempts,
            initial_delay: INITIAL_DELAY,
            max_delay: config
                .reconnect_max_wait
                .unwrap_or(DEFAULT_RECONNECT_MAX_WAIT),
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let jitter_cap = (base.as_millis() as u64 / 10).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
        (base + jitter).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `should_continue` declines another try. Attempts start at 1.
///
/// Aborting `abort` cuts a backoff short; an attempt already running is left to finish.
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    abort: Option<&AbortHandle>,
    mut op: F,
    mut should_continue: P,
) -> Result<T, LinkError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LinkError>>,
    P: FnMut(&LinkError, u32) -> bool,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            debug!(
                target: "tether::retry",
                attempt,
                error = %err,
                "non-retryable error; giving up"
            );
            return Err(err);
        }
        if attempt >= policy.max_attempts || !should_continue(&err, attempt) {
            return Err(err);
        }
        let delay = policy.delay_after(attempt);
        debug!(
            target: "tether::retry",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed; backing off"
        );
        match abort {
            Some(abort) => tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abort.aborted() => {
                    debug!(target: "tether::retry", attempt, "aborted during backoff");
                    return Err(err);
                }
            },
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Code, Status};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> LinkError {
        Status::new(Code::Unavailable, "down").into()
    }

    #[test]
    fn no_reconnect_collapses_attempts() {
        let config = DialConfig::new("bot").reconnect_max_attempts(7).no_reconnect(true);
        assert_eq!(RetryPolicy::for_dial(&config).max_attempts, 1);
        let config = DialConfig::new("bot").reconnect_max_attempts(7);
        assert_eq!(RetryPolicy::for_dial(&config).max_attempts, 7);
        assert_eq!(
            RetryPolicy::for_dial(&DialConfig::new("bot")).max_attempts,
            DEFAULT_RECONNECT_MAX_ATTEMPTS
        );
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert!(policy.delay_after(1) >= Duration::from_millis(100));
        assert!(policy.delay_after(2) >= Duration::from_millis(200));
        assert_eq!(policy.delay_after(9), Duration::from_millis(500));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };
        let result: Result<(), _> = retry(
            &policy,
            None,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            },
            |_, _| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &RetryPolicy::default(),
            None,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Status::new(Code::PermissionDenied, "no").into()) }
            },
            |_, _| true,
        )
        .await;
        assert_eq!(result.unwrap_err().code(), Code::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn predicate_can_stop_the_loop() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &RetryPolicy::default(),
            None,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            },
            |_, attempt| attempt < 2,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn success_ends_the_sequence() {
        let calls = AtomicU32::new(0);
        let value = retry(
            &RetryPolicy::default(),
            None,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(unavailable())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_, _| true,
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn abort_cuts_the_backoff_short() {
        let calls = AtomicU32::new(0);
        let abort = AbortHandle::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let started = tokio::time::Instant::now();
        let (result, ()) = tokio::join!(
            retry(
                &policy,
                Some(&abort),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(unavailable()) }
                },
                |_, _| true,
            ),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                abort.abort();
            },
        );
        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
