//! Error-handling middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use std::sync::Arc;

type OnError = Arc<dyn Fn(&dyn Job, &QueueError, Option<&str>) + Send + Sync>;

/// Invokes a callback on failure; the `rethrow` flag decides whether the
/// error keeps propagating or is swallowed here.
pub struct ErrorHandlingMiddleware {
    on_error: OnError,
    rethrow: bool,
}

impl ErrorHandlingMiddleware {
    pub fn new(on_error: impl Fn(&dyn Job, &QueueError, Option<&str>) + Send + Sync + 'static) -> Self {
        Self {
            on_error: Arc::new(on_error),
            rethrow: true,
        }
    }

    /// Swallow failures after the callback instead of propagating them.
    pub fn swallowing(mut self) -> Self {
        self.rethrow = false;
        self
    }
}

#[async_trait::async_trait]
impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &str {
        "error_handling"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        match next.run(ctx).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let stack = ctx
                    .metadata
                    .get("stack_trace")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned);
                (self.on_error)(ctx.job.as_ref(), &err, stack.as_deref());
                if self.rethrow {
                    Err(err)
                } else {
                    ctx.error = None;
                    Ok(())
                }
            }
        }
    }
}
