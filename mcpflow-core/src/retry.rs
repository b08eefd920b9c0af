//! ABOUTME: Exponential-backoff retry primitive shared by the transport and
//! ABOUTME: execution-engine layers

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Whether a failed operation should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

/// Classifies an error as retryable or not. Implemented per call-site: the
/// transport layer classifies transport/IO errors as retryable and
/// protocol-level tool errors as non-retryable.
pub trait ErrorClassifier<E> {
    fn classify(&self, error: &E) -> RetryDecision;
}

/// A classifier built from a plain closure.
pub struct FnClassifier<F>(pub F);

impl<E, F> ErrorClassifier<E> for FnClassifier<F>
where
    F: Fn(&E) -> RetryDecision,
{
    fn classify(&self, error: &E) -> RetryDecision {
        (self.0)(error)
    }
}

/// A classifier that always retries, for operations with no distinguishable
/// error categories.
pub struct AlwaysRetry;

impl<E> ErrorClassifier<E> for AlwaysRetry {
    fn classify(&self, _error: &E) -> RetryDecision {
        RetryDecision::Retry
    }
}

/// Retry schedule. `max_attempts` counts total attempts including the first,
/// so `max_attempts == 1` means no retry at all.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay between the 0-based `attempt_index`-th failed attempt and the
    /// next: `min(base_delay * 2^attempt_index, max_delay)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt_index {
            if delay >= self.max_delay {
                return self.max_delay;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.max_delay)
    }
}

/// Error returned once a retried operation exhausts its attempts, or fails
/// immediately on a non-retryable classification.
#[derive(Debug, thiserror::Error)]
#[error("operation failed after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Retries `op` according to `policy`, consulting `classifier` after each
/// failure. Non-retryable errors propagate immediately with `attempts == 1`
/// and no delay.
pub async fn with_retry<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    classifier: &C,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: ErrorClassifier<E>,
    E: fmt::Display,
{
    let mut attempt_index = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt_index > 0 {
                    info!(attempts = attempt_index + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let attempts_made = attempt_index + 1;
                let decision = classifier.classify(&err);
                if decision == RetryDecision::Stop || attempts_made >= policy.max_attempts {
                    return Err(RetryError {
                        attempts: attempts_made,
                        last_error: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt_index);
                warn!(attempt = attempts_made, ?delay, error = %err, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt_index += 1;
            }
        }
    }
}

/// Like [`with_retry`] but guarantees `cleanup` runs once the retry loop
/// settles, on every exit path. Cleanup failures are logged at WARN and never
/// mask the original outcome.
pub async fn with_retry_and_cleanup<T, E, Op, Fut, C, Cleanup, CleanupFut, CE>(
    policy: &RetryPolicy,
    classifier: &C,
    op: Op,
    cleanup: Cleanup,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: ErrorClassifier<E>,
    E: fmt::Display,
    Cleanup: FnOnce() -> CleanupFut,
    CleanupFut: Future<Output = Result<(), CE>>,
    CE: fmt::Display,
{
    let result = with_retry(policy, classifier, op).await;
    if let Err(cleanup_err) = cleanup().await {
        warn!(error = %cleanup_err, "cleanup after retry failed");
    }
    result
}

/// Read-only snapshot of accumulated retry statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_attempts: u64,
    pub total_wait: Duration,
}

/// Wraps [`with_retry`] and accumulates statistics across calls. Cheap to
/// clone (an `Arc`-free `Mutex`-guarded counter block), intended to be held
/// for the lifetime of a session manager or transport.
#[derive(Debug, Default)]
pub struct TimedRetry {
    stats: Mutex<RetryStats>,
}

impl TimedRetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<T, E, Op, Fut, C>(
        &self,
        policy: &RetryPolicy,
        classifier: &C,
        mut op: Op,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
        E: fmt::Display,
    {
        let started = std::time::Instant::now();
        let mut attempt_index = 0u32;
        let result = loop {
            match op().await {
                Ok(value) => break Ok(value),
                Err(err) => {
                    let attempts_made = attempt_index + 1;
                    let decision = classifier.classify(&err);
                    if decision == RetryDecision::Stop || attempts_made >= policy.max_attempts {
                        break Err(RetryError {
                            attempts: attempts_made,
                            last_error: err,
                        });
                    }
                    let delay = policy.delay_for_attempt(attempt_index);
                    tokio::time::sleep(delay).await;
                    attempt_index += 1;
                }
            }
        };

        let mut stats = self.stats.lock();
        stats.calls += 1;
        stats.total_attempts += u64::from(attempt_index + 1);
        stats.total_wait += started.elapsed();
        match &result {
            Ok(_) => stats.successes += 1,
            Err(_) => stats.failures += 1,
        }
        drop(stats);

        result
    }

    #[must_use]
    pub fn snapshot(&self) -> RetryStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom: {0}")]
    struct Boom(&'static str);

    fn retryable(_e: &Boom) -> RetryDecision {
        RetryDecision::Retry
    }

    fn non_retryable(_e: &Boom) -> RetryDecision {
        RetryDecision::Stop
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let classifier = FnClassifier(retryable);
        let result: Result<u32, RetryError<Boom>> =
            with_retry(&policy, &classifier, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_after_one_attempt() {
        let policy = RetryPolicy::default().with_max_attempts(5);
        let classifier = FnClassifier(non_retryable);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Boom>> = with_retry(&policy, &classifier, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Boom("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_error_exhausts_max_attempts() {
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5));
        let classifier = FnClassifier(retryable);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Boom>> = with_retry(&policy, &classifier, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Boom("still failing")) }
        })
        .await;
        assert_eq!(result.unwrap_err().attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::default()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(1));
        let classifier = FnClassifier(retryable);
        let calls = AtomicU32::new(0);
        let result: Result<&str, RetryError<Boom>> = with_retry(&policy, &classifier, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Boom("flaky"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_schedule_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn cleanup_runs_on_success_and_failure() {
        let policy = RetryPolicy::default().with_max_attempts(1);
        let classifier = FnClassifier(non_retryable);
        let cleaned = AtomicU32::new(0);
        let _: Result<(), RetryError<Boom>> = with_retry_and_cleanup(
            &policy,
            &classifier,
            || async { Err(Boom("x")) },
            || {
                cleaned.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), Boom>(()) }
            },
        )
        .await;
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_retry_accumulates_stats() {
        let timed = TimedRetry::new();
        let policy = RetryPolicy::default().with_max_attempts(1);
        let classifier = FnClassifier(non_retryable);
        let _: Result<(), RetryError<Boom>> = timed
            .run(&policy, &classifier, || async { Err(Boom("x")) })
            .await;
        let _: Result<u32, RetryError<Boom>> = timed.run(&policy, &classifier, || async { Ok(1) }).await;
        let snapshot = timed.snapshot();
        assert_eq!(snapshot.calls, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
    }
}
