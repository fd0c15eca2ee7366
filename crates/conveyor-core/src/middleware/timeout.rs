//! Timeout middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::{QueueError, QueueResult};
use std::time::Duration;

/// Races the rest of the chain against a deadline.
///
/// On elapse the in-flight future is dropped (tokio cancellation is
/// cooperative at await points) and the recorded outcome is
/// `QueueError::TimeoutMillis`, whatever the abandoned handler would have
/// done.
pub struct TimeoutMiddleware {
    duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait::async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        match tokio::time::timeout(self.duration, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                let err = QueueError::TimeoutMillis(self.duration.as_millis() as u64);
                ctx.error = Some(err.clone());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FlakyJob;
    use super::super::MiddlewarePipeline;
    use super::*;
    use crate::job::Job;
    use serde_json::{Map, Value};
    use std::sync::Arc;

    struct SlowJob;

    #[async_trait::async_trait]
    impl Job for SlowJob {
        fn job_type(&self) -> &str {
            "slow"
        }

        async fn handle(&self) -> QueueResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn to_map(&self) -> Map<String, Value> {
            Map::new()
        }
    }

    #[tokio::test]
    async fn test_fast_job_passes() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(TimeoutMiddleware::new(Duration::from_secs(5))));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("ok", 0)), "id-1");
        pipeline.execute(&mut ctx).await.unwrap();
        assert!(ctx.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_times_out() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(TimeoutMiddleware::new(Duration::from_millis(50))));

        let mut ctx = JobExecutionContext::new(Arc::new(SlowJob), "id-1");
        let err = pipeline.execute(&mut ctx).await.unwrap_err();

        assert_eq!(err, QueueError::TimeoutMillis(50));
        assert!(ctx.error.as_ref().unwrap().is_timeout());
    }
}
