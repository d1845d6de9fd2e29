//! Exponential-backoff retry for transient graph failures

use std::future::Future;
use std::time::Duration;

use crate::error::{GraphError, GraphResult};

/// Retry policy for the query layer
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying retryable errors with doubling backoff
    pub async fn run<T, F, Fut>(&self, op: F) -> GraphResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GraphResult<T>>,
    {
        let mut backoff = self.initial_backoff;
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    max = self.max_retries,
                    "graph query failed, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| GraphError::Unavailable("retries exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: GraphResult<u32> = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(GraphError::Unavailable("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: GraphResult<u32> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GraphError::Query("bad cypher".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
