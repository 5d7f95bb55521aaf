//! Timeout and bounded retry for boundary calls.

use std::future::Future;
use std::time::Duration;

use crate::boundary::BoundaryError;
use crate::error::SyncError;

const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Per-call limits applied to every external request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff_base: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl CallPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Run `op` under `policy`, retrying transient failures with exponential
/// backoff. Exhaustion surfaces as [`SyncError::Connectivity`].
pub async fn call<T, F, Fut>(policy: CallPolicy, target: &str, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BoundaryError>>,
{
    let mut backoff = policy.backoff_base;
    let mut last = String::new();

    for attempt in 1..=policy.attempts() {
        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(BoundaryError::Rejected(message))) => {
                return Err(SyncError::Rejected {
                    target: target.to_string(),
                    message,
                });
            }
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = format!("timed out after {:?}", policy.timeout),
        }

        if attempt < policy.attempts() {
            tracing::warn!(
                "{target}: attempt {attempt}/{} failed ({last}); retrying",
                policy.attempts()
            );
            tokio::time::sleep(backoff.min(BACKOFF_MAX)).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    Err(SyncError::Connectivity {
        target: target.to_string(),
        attempts: policy.attempts(),
        message: last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(50),
            retries: 2,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let value = call(fast(), "vcs", || {
            let calls = &calls;
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BoundaryError::Unavailable("503".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_a_connectivity_error() {
        let err = call(fast(), "cluster", || async {
            Err::<(), _>(BoundaryError::Unavailable("refused".into()))
        })
        .await
        .unwrap_err();
        match err {
            SyncError::Connectivity {
                target, attempts, ..
            } => {
                assert_eq!(target, "cluster");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = call(fast(), "vcs", || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BoundaryError::Rejected("403".into()))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let err = call(fast(), "cluster", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BoundaryError>(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
