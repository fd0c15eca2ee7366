//! In-place retry middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::{QueueError, QueueResult};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type ShouldRetry = Arc<dyn Fn(&QueueError) -> bool + Send + Sync>;

/// Retries the rest of the chain in place, without going back through the
/// driver's scheduling path. Delay grows linearly: `base_delay × attempt`.
///
/// The final attempt's error is rethrown so the driver's own failure
/// handling (reschedule or dead-letter) still applies.
pub struct RetryMiddleware {
    max_attempts: u32,
    base_delay: Duration,
    should_retry: Option<ShouldRetry>,
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            should_retry: None,
        }
    }

    /// Gate retries on a predicate over the failure (default: retry all).
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&QueueError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    fn retryable(&self, error: &QueueError) -> bool {
        self.should_retry.as_ref().map_or(true, |p| p(error))
    }
}

#[async_trait::async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        let mut attempt = 1u32;
        loop {
            ctx.metadata.insert("attempts".into(), json!(attempt));
            match next.run(ctx).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= self.max_attempts || !self.retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.base_delay.saturating_mul(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FlakyJob;
    use super::super::MiddlewarePipeline;
    use super::*;

    #[tokio::test]
    async fn test_retries_until_success() {
        let job = Arc::new(FlakyJob::new("flaky", 2));
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(RetryMiddleware::new(3, Duration::from_millis(1))));

        let mut ctx = JobExecutionContext::new(job.clone(), "id-1");
        pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(job.calls(), 3);
        assert!(ctx.is_success());
        assert_eq!(ctx.metadata.get("attempts"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_rethrows_final_error() {
        let job = Arc::new(FlakyJob::new("hopeless", 10));
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(RetryMiddleware::new(2, Duration::from_millis(1))));

        let mut ctx = JobExecutionContext::new(job.clone(), "id-1");
        let err = pipeline.execute(&mut ctx).await.unwrap_err();

        assert!(matches!(err, QueueError::Handler(_)));
        assert_eq!(job.calls(), 2);
    }

    #[tokio::test]
    async fn test_predicate_blocks_retry() {
        let job = Arc::new(FlakyJob::new("flaky", 1));
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(
            RetryMiddleware::new(5, Duration::from_millis(1)).with_predicate(|_| false),
        ));

        let mut ctx = JobExecutionContext::new(job.clone(), "id-1");
        assert!(pipeline.execute(&mut ctx).await.is_err());
        assert_eq!(job.calls(), 1);
    }
}
