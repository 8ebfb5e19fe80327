use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout and retry settings for one logical read.
///
/// Attempt `i` (zero-based) gets `base_timeout + i * timeout_step`; after a
/// failed attempt the caller waits `base_delay * 2^i` before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_timeout: Duration,
    pub timeout_step: Duration,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_timeout: Duration::from_millis(8000),
            timeout_step: Duration::from_millis(1000),
            base_delay: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.base_timeout
            .saturating_add(self.timeout_step.saturating_mul(attempt))
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Sum of all backoff delays taken when every attempt fails.
    #[cfg(test)]
    pub fn total_backoff(&self) -> Duration {
        (0..self.retries)
            .map(|attempt| self.backoff_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Upper bound on end-to-end latency: every timeout plus every backoff.
    #[cfg(test)]
    pub fn worst_case(&self) -> Duration {
        (0..self.attempts())
            .map(|attempt| self.timeout_for(attempt))
            .fold(self.total_backoff(), Duration::saturating_add)
    }
}

#[derive(Debug, Error)]
pub enum FetchError<E> {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("{0}")]
    Operation(E),
}

impl<E> FetchError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Races `fut` against a timer. On expiry the token is cancelled so the
/// operation can stop its own work, and a timeout error is returned.
pub async fn with_timeout<T, E, Fut>(
    token: &CancellationToken,
    limit: Duration,
    fut: Fut,
) -> Result<T, FetchError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        outcome = fut => outcome.map_err(FetchError::Operation),
        _ = sleep(limit) => {
            token.cancel();
            Err(FetchError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

/// Runs `op` under `policy`, handing each attempt a fresh cancellation token.
pub async fn retrying_call<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, FetchError<E>>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retrying_call_with(policy, &CancellationToken::new(), op).await
}

/// Like [`retrying_call`], with attempt tokens derived from `parent` so the
/// caller can abandon the whole call.
pub async fn retrying_call_with<T, E, F, Fut>(
    policy: &RetryPolicy,
    parent: &CancellationToken,
    mut op: F,
) -> Result<T, FetchError<E>>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut last_error = FetchError::Cancelled;
    for attempt in 0..attempts {
        if parent.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let token = parent.child_token();
        let limit = policy.timeout_for(attempt);
        debug!(
            target = "emlak.fetch",
            attempt,
            timeout_ms = limit.as_millis() as u64,
            "attempt started"
        );
        match with_timeout(&token, limit, op(token.clone())).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(target = "emlak.fetch", attempt, error = %err, "attempt failed");
                last_error = err;
            }
        }
        if attempt + 1 < attempts {
            let delay = policy.backoff_for(attempt);
            tokio::select! {
                _ = parent.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;

    #[test]
    fn policy_defaults_match_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.timeout_for(0), Duration::from_millis(8000));
        assert_eq!(policy.timeout_for(3), Duration::from_millis(11000));
        assert_eq!(policy.backoff_for(0), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1600));
        assert_eq!(policy.total_backoff(), Duration::from_millis(2800));
        assert_eq!(policy.worst_case(), Duration::from_millis(40800));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_call_makes_every_attempt() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result: Result<(), FetchError<String>> = retrying_call(&policy, |_token| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("boom {n}"))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), policy.retries + 1);
        assert!(started.elapsed() >= policy.total_backoff());
        match result {
            Err(FetchError::Operation(message)) => assert_eq!(message, "boom 3"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_the_attempt_token() {
        let policy = RetryPolicy {
            retries: 0,
            ..RetryPolicy::default()
        };
        let seen = Arc::new(std::sync::Mutex::new(None::<CancellationToken>));
        let result: Result<(), FetchError<String>> = retrying_call(&policy, |token| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(token.clone());
                token.cancelled().await;
                Err("stopped".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Timeout { timeout_ms: 8000 })));
        let token = seen.lock().unwrap().clone().expect("attempt ran");
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_call_gives_up_after_worst_case_latency() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result: Result<(), FetchError<String>> = retrying_call(&policy, |_token| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending()
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(result, Err(FetchError::Timeout { timeout_ms: 11000 })));
        assert_eq!(started.elapsed(), policy.worst_case());
        assert_eq!(policy.worst_case(), Duration::from_millis(40800));
    }

    #[tokio::test(start_paused = true)]
    async fn later_attempt_success_is_returned() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let value = retrying_call(&policy, |_token| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_parent_stops_retrying() {
        let policy = RetryPolicy::default();
        let parent = CancellationToken::new();
        parent.cancel();
        let result: Result<(), FetchError<String>> =
            retrying_call_with(&policy, &parent, |_token| async { Ok(()) }).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
