//! Retry policies and the runners that consume them.
//!
//! Two callers share one policy type:
//!
//! - the ready-dependency invoker retries a notifier a bounded number of
//!   times ([`with_retry_outcome`], sequential: the next attempt starts after
//!   the previous one failed and the delay elapsed);
//! - the confirmation poller re-checks payment status forever
//!   ([`spawn_repeating`], timer-driven: every tick fires on schedule whether
//!   or not earlier work has finished).
//!
//! # Usage
//!
//! ```rust,ignore
//! use paywatch_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::fixed(Duration::from_millis(500), Some(6));
//! let result = with_retry(&policy, || async { notify().await }).await;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::{InvokerConfig, PollerConfig};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry (1.0 = fixed cadence).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (0.0 = none).
    pub jitter_percent: f64,
    /// Maximum number of attempts including the first. None = forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts: max_attempts.map(|max| max.max(1)),
        }
    }

    /// Jitter-free fixed cadence.
    #[must_use]
    pub fn fixed(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self::new(interval, interval, 1.0, 0.0, max_attempts)
    }

    /// Policy for late-bound notifiers: one immediate attempt plus
    /// `max_retries` retries at a fixed delay (500ms x 5 by default).
    #[must_use]
    pub fn notifier(config: &InvokerConfig) -> Self {
        Self::fixed(
            Duration::from_millis(config.retry_delay_ms),
            Some(config.max_retries.saturating_add(1)),
        )
    }

    /// Policy for payment verification: fixed interval, never gives up.
    #[must_use]
    pub fn verification(config: &PollerConfig) -> Self {
        Self::fixed(config.interval(), None)
    }

    /// Whether attempt number `attempt` (1-based) is within budget.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Calculate the delay after the given failed attempt (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // ms values are well within f64 precision for delays
    #[allow(clippy::cast_possible_wrap)] // attempt is capped at 31, safe for i32
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an async operation with retry.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Execute an async operation with retry, returning detailed outcome.
///
/// The first attempt runs immediately. Each failure waits
/// `delay_for_attempt` before the next try, until the policy's attempt
/// budget is spent.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !policy.allows_attempt(attempt + 1) {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts.unwrap_or(attempt),
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                sleep(delay).await;
            }
        }
    }
}

/// Handle to a timer started by [`spawn_repeating`].
#[derive(Debug)]
pub struct RepeatingSchedule {
    handle: Option<JoinHandle<()>>,
}

impl RepeatingSchedule {
    /// Stop the timer. Returns `true` only for the call that actually
    /// stopped it.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether the timer is still armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RepeatingSchedule {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fire `tick(attempt)` on the policy's schedule, starting at attempt
/// `first_attempt`, without waiting for work started by earlier ticks.
///
/// `tick` must not block; it typically spawns the actual work. The timer
/// stops when the policy's attempt budget runs out or the returned schedule
/// is cancelled or dropped.
pub fn spawn_repeating<F>(policy: RetryPolicy, first_attempt: u32, mut tick: F) -> RepeatingSchedule
where
    F: FnMut(u32) + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut attempt = first_attempt.max(1);
        while policy.allows_attempt(attempt) {
            sleep(policy.delay_for_attempt(attempt.saturating_sub(2))).await;
            tick(attempt);
            attempt = attempt.saturating_add(1);
        }
        debug!(attempts = attempt - 1, "Repeating schedule exhausted");
    });
    RepeatingSchedule {
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_calculation_with_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(5),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500), Some(6));
        for attempt in 0..10 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(500));
        }
        assert!(policy.allows_attempt(6));
        assert!(!policy.allows_attempt(7));
    }

    #[test]
    fn unbounded_policy_allows_everything() {
        let policy = RetryPolicy::verification(&PollerConfig::default());
        assert!(policy.allows_attempt(u32::MAX));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(8));
    }

    #[test]
    fn notifier_policy_counts_first_attempt() {
        let policy = RetryPolicy::notifier(&InvokerConfig::default());
        assert_eq!(policy.max_attempts, Some(6));
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn jitter_within_range() {
        let policy = RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            1.0,
            0.1,
            Some(5),
        );
        for _ in 0..100 {
            let delay_ms = policy.delay_for_attempt(0).as_millis() as f64;
            assert!(delay_ms >= 900.0, "delay too small: {delay_ms}");
            assert!(delay_ms <= 1100.0, "delay too large: {delay_ms}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_failures() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500), Some(6));
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let outcome = with_retry_outcome(&policy, || {
            let count = Arc::clone(&call_count_clone);
            async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient failure")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.elapsed, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500), Some(6));
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let outcome = with_retry_outcome(&policy, || {
            let count = Arc::clone(&call_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("never ready")
            }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 6);
        assert_eq!(call_count.load(Ordering::SeqCst), 6);
        // five gaps of 500ms between six attempts
        assert_eq!(outcome.elapsed, Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_schedule_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicU32::new(0));
        let ticks_clone = Arc::clone(&ticks);
        let mut schedule = spawn_repeating(
            RetryPolicy::fixed(Duration::from_secs(8), None),
            2,
            move |_| {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        sleep(Duration::from_millis(24_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(schedule.cancel());
        assert!(!schedule.cancel());
        sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_schedule_respects_budget() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let schedule = spawn_repeating(
            RetryPolicy::fixed(Duration::from_millis(10), Some(4)),
            2,
            move |attempt| seen_clone.lock().unwrap().push(attempt),
        );

        sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec![2, 3, 4]);
        assert!(!schedule.is_active());
    }
}
