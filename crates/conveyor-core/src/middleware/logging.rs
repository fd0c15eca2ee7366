//! Logging middleware with an injected sink

use super::{JobExecutionContext, Middleware, Next};
use crate::error::QueueResult;
use std::sync::Arc;

/// Destination for middleware log lines. Injected so embedders can route
/// queue logs wherever they want; the default forwards to `tracing`.
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink forwarding to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn info(&self, message: &str) {
        tracing::info!(target: "conveyor::jobs", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "conveyor::jobs", "{message}");
    }
}

/// Emits "starting" and "completed/failed in N ms" lines around execution.
pub struct LoggingMiddleware {
    sink: Arc<dyn LogSink>,
}

impl LoggingMiddleware {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogSink))
    }
}

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        let job_name = ctx.job.display_name();
        self.sink
            .info(&format!("starting job '{job_name}' (id={})", ctx.job_id));

        let result = next.run(ctx).await;
        let elapsed_ms = ctx.elapsed().as_millis();

        match &result {
            Ok(()) => self
                .sink
                .info(&format!("job '{job_name}' completed in {elapsed_ms} ms")),
            Err(err) => self.sink.error(&format!(
                "job '{job_name}' failed in {elapsed_ms} ms: {err}"
            )),
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

    #[derive(Default)]
    struct CapturingSink {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for CapturingSink {
        fn info(&self, message: &str) {
            self.lines.lock().unwrap().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.lines.lock().unwrap().push(format!("ERROR {message}"));
        }
    }

    #[tokio::test]
    async fn test_logs_success() {
        let sink = Arc::new(CapturingSink::default());
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(LoggingMiddleware::new(sink.clone())));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("ok", 0)), "id-1");
        pipeline.execute(&mut ctx).await.unwrap();

        let lines = sink.lines.lock().unwrap();
        assert!(lines[0].contains("starting job 'ok'"));
        assert!(lines[1].contains("completed in"));
    }

    #[tokio::test]
    async fn test_logs_failure() {
        let sink = Arc::new(CapturingSink::default());
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(LoggingMiddleware::new(sink.clone())));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("bad", 1)), "id-1");
        assert!(pipeline.execute(&mut ctx).await.is_err());

        let lines = sink.lines.lock().unwrap();
        assert!(lines[1].starts_with("ERROR"));
        assert!(lines[1].contains("failed in"));
    }
}
