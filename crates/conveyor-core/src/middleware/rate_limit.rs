//! Token-bucket rate limiting middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::QueueResult;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Gates job execution at `max_jobs_per_second`.
///
/// The bucket lock is held across the wait, so waiters are served in arrival
/// order (tokio mutexes are fair).
pub struct RateLimitMiddleware {
    rate_per_sec: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimitMiddleware {
    pub fn new(max_jobs_per_second: f64) -> Self {
        let rate = max_jobs_per_second.max(f64::MIN_POSITIVE);
        Self {
            rate_per_sec: rate,
            burst: rate.max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: rate.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
            bucket.last_refill = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let deficit = (1.0 - bucket.tokens) / self.rate_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(deficit)).await;
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        self.acquire().await;
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FlakyJob;
    use super::super::MiddlewarePipeline;
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_limits_execution_rate() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(RateLimitMiddleware::new(10.0)));

        let start = Instant::now();
        // Burst allowance covers the first 10; the next 5 wait 100 ms each.
        for i in 0..15 {
            let mut ctx =
                JobExecutionContext::new(Arc::new(FlakyJob::new("ok", 0)), format!("id-{i}"));
            pipeline.execute(&mut ctx).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_single_job_immediate() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(RateLimitMiddleware::new(1.0)));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("ok", 0)), "id-1");
        pipeline.execute(&mut ctx).await.unwrap();
        assert!(ctx.is_success());
    }
}
