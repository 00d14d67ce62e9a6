//! Reconnection pacing: exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConnectionError, Result};

/// Delay before the second attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Longest delay between two attempts.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Consecutive failures tolerated before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Exponential backoff policy.
///
/// Attempt `n` (1-based) that fails is followed by a sleep of
/// `min(base * 2^(n-1), cap)`, scaled by a random factor in `[0.5, 1.0]`
/// and floored at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Smallest delay and growth unit.
    pub base: Duration,
    /// Upper bound of the un-jittered delay.
    pub cap: Duration,
    /// Attempts made before the last error is surfaced.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            cap: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Sets the base delay.
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Sets the delay cap.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Un-jittered delay after attempt `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent);
        if secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay after attempt `attempt`, using the thread-local RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay after attempt `attempt`, using the given RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor: f64 = rng.gen_range(0.5..=1.0);
        self.ceiling(attempt).mul_f64(factor).max(self.base)
    }

    /// Runs `op` until it succeeds, the budget is spent, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number. The counter is local to
    /// this call. Cancellation yields [`ConnectionError::Closed`].
    pub async fn retry<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Closed),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(ConnectionError::Closed) => return Err(ConnectionError::Closed),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                return Err(ConnectionError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            warn!(attempt, ?delay, error = %err, "attempt failed, backing off");

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ProtocolError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn refused() -> ConnectionError {
        ConnectionError::Protocol(ProtocolError::ConnectionClosed("refused".to_string()))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_base(Duration::from_millis(1))
            .with_cap(Duration::from_millis(4))
            .with_max_attempts(max_attempts)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base, Duration::from_millis(500));
        assert_eq!(policy.cap, Duration::from_secs(300));
        assert_eq!(policy.max_attempts, 100);
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(1), Duration::from_millis(500));
        assert_eq!(policy.ceiling(2), Duration::from_secs(1));
        assert_eq!(policy.ceiling(5), Duration::from_secs(8));
        assert_eq!(policy.ceiling(10), Duration::from_secs(256));
        assert_eq!(policy.ceiling(11), Duration::from_secs(300));
        assert_eq!(policy.ceiling(100), Duration::from_secs(300));
    }

    #[test]
    fn test_delays_stay_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=5 {
            let upper = (0.5 * 2f64.powi(attempt as i32 - 1)).min(300.0);
            for _ in 0..200 {
                let delay = policy.delay_with(attempt, &mut rng).as_secs_f64();
                assert!(delay >= 0.5, "attempt {} delay {} below base", attempt, delay);
                assert!(delay <= upper + 1e-9, "attempt {} delay {} above {}", attempt, delay, upper);
            }
        }
    }

    #[test]
    fn test_jitter_spreads_delays() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let delays: Vec<Duration> = (0..50).map(|_| policy.delay_with(6, &mut rng)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(min < max);
        assert!(*min >= Duration::from_secs(8));
        assert!(*max <= Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let cancel = CancellationToken::new();

        let result = fast_policy(10)
            .retry(&cancel, |attempt| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(refused())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_last_error() {
        let cancel = CancellationToken::new();
        let result: Result<()> = fast_policy(4)
            .retry(&cancel, |_| async { Err(refused()) })
            .await;

        match result {
            Err(ConnectionError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(source.to_string().contains("refused"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_counter_is_per_call() {
        let policy = fast_policy(3);
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let first = policy.retry(&cancel, |attempt| async move { Ok(attempt) }).await;
            assert_eq!(first.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let policy = RetryPolicy::default().with_base(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let handle = tokio::spawn(async move {
            let result: Result<()> = policy.retry(&cancel, |_| async { Err(refused()) }).await;
            result
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }
}
