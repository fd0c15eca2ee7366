//! Timing middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::QueueResult;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

type OnComplete = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Measures wall-clock execution time, stores it in the context metadata
/// under `processing_time_ms`, and invokes an optional completion callback
/// (on failure as well).
#[derive(Default)]
pub struct TimingMiddleware {
    on_complete: Option<OnComplete>,
}

impl TimingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: impl Fn(&str, Duration) + Send + Sync + 'static) -> Self {
        Self {
            on_complete: Some(Arc::new(callback)),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        let start = Instant::now();
        let result = next.run(ctx).await;
        let elapsed = start.elapsed();

        ctx.metadata.insert(
            "processing_time_ms".into(),
            json!(elapsed.as_millis() as u64),
        );

        if let Some(on_complete) = &self.on_complete {
            on_complete(&ctx.job.display_name(), elapsed);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FlakyJob;
    use super::super::MiddlewarePipeline;
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_records_processing_time() {
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(TimingMiddleware::new()));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("ok", 0)), "id-1");
        pipeline.execute(&mut ctx).await.unwrap();

        assert!(ctx.metadata.get("processing_time_ms").unwrap().is_u64());
    }

    #[tokio::test]
    async fn test_callback_fires_on_failure() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(TimingMiddleware::with_callback(move |name, _| {
            seen_clone.lock().unwrap().push(name.to_string());
        })));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("bad", 1)), "id-1");
        assert!(pipeline.execute(&mut ctx).await.is_err());

        assert_eq!(*seen.lock().unwrap(), vec!["bad"]);
    }
}
