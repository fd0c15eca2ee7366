//! Before/after hook middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::QueueResult;
use std::sync::Arc;

type Hook = Arc<dyn Fn(&JobExecutionContext) + Send + Sync>;

/// Invokes `before` ahead of the chain and `after` once it returns,
/// including on failure.
#[derive(Default)]
pub struct HookMiddleware {
    before: Option<Hook>,
    after: Option<Hook>,
}

impl HookMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, hook: impl Fn(&JobExecutionContext) + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn after(mut self, hook: impl Fn(&JobExecutionContext) + Send + Sync + 'static) -> Self {
        self.after = Some(Arc::new(hook));
        self
    }
}

#[async_trait::async_trait]
impl Middleware for HookMiddleware {
    fn name(&self) -> &str {
        "hook"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        if let Some(before) = &self.before {
            before(ctx);
        }
        let result = next.run(ctx).await;
        if let Some(after) = &self.after {
            after(ctx);
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
    async fn test_hooks_run_in_order() {
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let before_trace = trace.clone();
        let after_trace = trace.clone();

        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(
            HookMiddleware::new()
                .before(move |_| before_trace.lock().unwrap().push("before"))
                .after(move |_| after_trace.lock().unwrap().push("after")),
        ));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("ok", 0)), "id-1");
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_after_runs_on_failure() {
        let seen_error = Arc::new(Mutex::new(false));
        let seen_clone = seen_error.clone();

        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(HookMiddleware::new().after(move |ctx| {
            *seen_clone.lock().unwrap() = ctx.has_error();
        })));

        let mut ctx = JobExecutionContext::new(Arc::new(FlakyJob::new("bad", 1)), "id-1");
        assert!(pipeline.execute(&mut ctx).await.is_err());
        assert!(*seen_error.lock().unwrap());
    }
}
