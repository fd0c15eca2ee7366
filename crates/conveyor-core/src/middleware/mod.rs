//! Composable middleware pipeline around job execution
//!
//! Middleware wrap the job handler in onion order: each receives the shared
//! execution context and a `next` continuation for the remainder of the
//! chain. The terminal continuation invokes the job's own handler and
//! records the outcome on the context.

pub mod conditional;
pub mod dedupe;
pub mod error_handling;
pub mod hook;
pub mod logging;
pub mod rate_limit;
pub mod retry;
pub mod timeout;
pub mod timing;

pub use conditional::ConditionalMiddleware;
pub use dedupe::DeduplicationMiddleware;
pub use error_handling::ErrorHandlingMiddleware;
pub use hook::HookMiddleware;
pub use logging::{LogSink, LoggingMiddleware, TracingLogSink};
pub use rate_limit::RateLimitMiddleware;
pub use retry::RetryMiddleware;
pub use timeout::TimeoutMiddleware;
pub use timing::TimingMiddleware;

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state for a single job execution.
pub struct JobExecutionContext {
    /// The job being executed
    pub job: Arc<dyn Job>,

    /// Context id of the enqueued job
    pub job_id: String,

    /// Metadata visible to (and mutable by) every middleware
    pub metadata: Map<String, Value>,

    /// Start of this execution
    pub started_at: Instant,

    /// Failure recorded by the terminal handler or a middleware
    pub error: Option<QueueError>,

    /// Result slot for middleware that produce one
    pub result: Option<Value>,
}

impl JobExecutionContext {
    pub fn new(job: Arc<dyn Job>, job_id: impl Into<String>) -> Self {
        Self {
            job,
            job_id: job_id.into(),
            metadata: Map::new(),
            started_at: Instant::now(),
            error: None,
            result: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Wall-clock time since this execution started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A single middleware in the pipeline.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Stable name used by `MiddlewarePipeline::remove`.
    fn name(&self) -> &str;

    /// Run this middleware around the rest of the chain.
    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()>;
}

/// Continuation over the remainder of the chain.
///
/// `Copy`, so middleware that re-run the tail (retry) can invoke it more
/// than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Invoke the remainder of the chain, ending in the job handler.
    pub async fn run(self, ctx: &mut JobExecutionContext) -> QueueResult<()> {
        match self.chain.split_first() {
            Some((middleware, rest)) => middleware.handle(ctx, Next { chain: rest }).await,
            None => {
                let job = Arc::clone(&ctx.job);
                match job.handle().await {
                    Ok(()) => {
                        ctx.error = None;
                        Ok(())
                    }
                    Err(err) => {
                        ctx.error = Some(err.clone());
                        Err(err)
                    }
                }
            }
        }
    }
}

/// Ordered middleware chain executed around every job.
#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs around everything added after it.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Insert at a position (clamped to the current length).
    pub fn add_at(&mut self, index: usize, middleware: Arc<dyn Middleware>) -> &mut Self {
        let index = index.min(self.middleware.len());
        self.middleware.insert(index, middleware);
        self
    }

    /// Remove a middleware by name.
    pub fn remove(&mut self, name: &str) -> QueueResult<()> {
        let position = self
            .middleware
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| QueueError::MiddlewareNotFound(name.to_string()))?;
        self.middleware.remove(position);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.middleware.clear();
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Execute the chain for one job.
    pub async fn execute(&self, ctx: &mut JobExecutionContext) -> QueueResult<()> {
        Next {
            chain: &self.middleware,
        }
        .run(ctx)
        .await
    }
}
