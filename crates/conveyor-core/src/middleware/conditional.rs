//! Conditional middleware wrapper

use super::{JobExecutionContext, Middleware, Next};
use crate::error::QueueResult;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&JobExecutionContext) -> bool + Send + Sync>;

/// Runs the wrapped middleware only when the predicate holds for the
/// context; otherwise the chain continues as if the wrapper weren't there.
pub struct ConditionalMiddleware {
    predicate: Predicate,
    wrapped: Arc<dyn Middleware>,
}

impl ConditionalMiddleware {
    pub fn new(
        predicate: impl Fn(&JobExecutionContext) -> bool + Send + Sync + 'static,
        wrapped: Arc<dyn Middleware>,
    ) -> Self {
        Self {
            predicate: Arc::new(predicate),
            wrapped,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for ConditionalMiddleware {
    fn name(&self) -> &str {
        "conditional"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        if (self.predicate)(ctx) {
            self.wrapped.handle(ctx, next).await
        } else {
            next.run(ctx).await
        }
    }
}
