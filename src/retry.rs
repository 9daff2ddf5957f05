use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::errors::MessagingError;

/// Future returned by a retryable operation.
pub type AttemptFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, MessagingError>> + Send + 'a>>;

/// Fixed-delay retry schedule. `max_attempts` of `None` means retry until
/// the deadline (the -1 configuration value); a policy is never built for a
/// retry count of zero.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from an operator-facing attempt count. Returns `None`
    /// for `attempts == 0`, meaning the operation runs exactly once.
    pub fn new(attempts: i32, delay: Duration) -> Option<Self> {
        match attempts {
            0 => None,
            n if n < 0 => Some(Self {
                max_attempts: None,
                delay,
            }),
            n => Some(Self {
                max_attempts: Some(n as u32),
                delay,
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` until it succeeds, the predicate declines the error, the
    /// attempts are exhausted or the deadline passes. Each attempt is
    /// bounded by the time remaining until the deadline.
    pub async fn run<'a, T, P, F>(
        &self,
        deadline: Option<Instant>,
        predicate: P,
        mut op: F,
    ) -> Result<T, MessagingError>
    where
        P: Fn(&MessagingError) -> bool,
        F: FnMut() -> AttemptFuture<'a, T>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = match deadline {
                Some(at) => match tokio::time::timeout_at(at, op()).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(MessagingError::Timeout(
                            "deadline reached while retrying".to_string(),
                        ))
                    }
                },
                None => op().await,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let attempts_left = self.max_attempts.map_or(true, |max| attempt < max);
            if !attempts_left || !predicate(&err) {
                return Err(err);
            }
            if let Some(at) = deadline {
                if Instant::now() + self.delay >= at {
                    return Err(err);
                }
            }

            warn!(attempt, error = %err, "retrying after failure");
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Run an operation once when no policy applies, otherwise via the policy.
pub async fn run_with<'a, T, P, F>(
    policy: Option<&RetryPolicy>,
    deadline: Option<Instant>,
    predicate: P,
    mut op: F,
) -> Result<T, MessagingError>
where
    P: Fn(&MessagingError) -> bool,
    F: FnMut() -> AttemptFuture<'a, T>,
{
    match policy {
        Some(policy) => policy.run(deadline, predicate, op).await,
        None => match deadline {
            Some(at) => tokio::time::timeout_at(at, op()).await.unwrap_or_else(|_| {
                Err(MessagingError::Timeout(
                    "deadline reached before completion".to_string(),
                ))
            }),
            None => op().await,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_matching_errors_exactly_max_attempts_times() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result: Result<(), _> = policy
            .run(None, MessagingError::is_delivery_failure, move || {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(MessagingError::Rejected("nack".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(MessagingError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_unmatched_errors() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result: Result<(), _> = policy
            .run(None, MessagingError::is_delivery_failure, move || {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(MessagingError::Timeout("nope".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(MessagingError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(-1, Duration::from_millis(250)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let result = policy
            .run(None, |_| true, move || {
                let counted = counted.clone();
                Box::pin(async move {
                    if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MessagingError::Connection("flap".to_string()))
                    } else {
                        Ok(42)
                    }
                })
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_retry_stops_at_the_deadline() {
        let policy = RetryPolicy::new(-1, Duration::from_millis(250)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);

        let result: Result<(), _> = policy
            .run(Some(deadline), |_| true, || {
                Box::pin(async { Err(MessagingError::Connection("down".to_string())) })
            })
            .await;

        assert!(result.is_err());
        assert!(Instant::now() <= deadline + Duration::from_millis(250));
    }

    #[test]
    fn zero_attempts_builds_no_policy() {
        assert!(RetryPolicy::new(0, Duration::from_millis(250)).is_none());
        assert!(RetryPolicy::new(-1, Duration::from_millis(250)).is_some());
        assert!(RetryPolicy::new(3, Duration::from_millis(250)).is_some());
    }
}
