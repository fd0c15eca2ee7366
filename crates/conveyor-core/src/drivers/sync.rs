//! Synchronous driver: executes jobs inline on enqueue

use super::{DriverCore, ExecutionOutcome, QueueDriver};
use crate::error::QueueResult;
use crate::job::{EnqueueOptions, Job};
use crate::metrics::QueueMetrics;
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Runs the whole lifecycle inside `enqueue`: the delay is honored by
/// sleeping, retries happen inline, and terminal failures go straight to the
/// dead-letter store. `process_one` and `clear` are no-ops and the queue
/// depth is always zero.
pub struct SyncDriver {
    core: DriverCore,
}

impl SyncDriver {
    pub fn new(core: DriverCore) -> Self {
        Self { core }
    }

    /// Driver with a fresh registry and metrics, mostly for tests and
    /// simple embedders.
    pub fn with_defaults(name: &str) -> Self {
        let core = DriverCore::new(
            name,
            Arc::new(JobRegistry::new()),
            Arc::new(QueueMetrics::new()),
            None,
            RetryPolicy::default(),
        )
        .expect("non-empty driver name");
        Self { core }
    }

    pub fn core(&self) -> &DriverCore {
        &self.core
    }
}

#[async_trait::async_trait]
impl QueueDriver for SyncDriver {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn enqueue(&self, job: Arc<dyn Job>, options: EnqueueOptions) -> QueueResult<String> {
        if let Some(delay) = options.delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        // The context is created after the delay so it is immediately ready.
        let immediate = EnqueueOptions {
            delay: None,
            priority: options.priority,
        };
        let mut ctx = self.core.new_context(job, &immediate);
        let id = ctx.id.clone();

        loop {
            match self.core.execute(&mut ctx).await {
                ExecutionOutcome::Completed | ExecutionOutcome::DeadLettered => break,
                ExecutionOutcome::Retried(delay) => {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Ok(id)
    }

    async fn process_one(&self) -> QueueResult<bool> {
        Ok(false)
    }

    async fn queue_depth(&self) -> usize {
        0
    }

    async fn clear(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn dispose(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn stats(&self) -> Map<String, Value> {
        self.core.base_stats(0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetterQueue};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_executes_inline() {
        let driver = SyncDriver::with_defaults("sync");
        let (job, executed) = ProbeJob::new("inline");

        driver.enqueue(job, EnqueueOptions::new()).await.unwrap();

        assert!(executed.load(Ordering::SeqCst));
        assert_eq!(driver.queue_depth().await, 0);
        assert_eq!(driver.core().metrics().total_completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_honors_delay() {
        let driver = SyncDriver::with_defaults("sync");
        let (job, executed) = ProbeJob::new("delayed");

        let start = tokio::time::Instant::now();
        driver
            .enqueue(
                job,
                EnqueueOptions::new().with_delay(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert!(executed.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retries_inline_then_succeeds() {
        let core = core_with(RetryPolicy::new(3, Duration::from_millis(1)), None);
        let driver = SyncDriver::new(core);
        let job = ProbeJob::failing("flaky", 2);

        driver.enqueue(job.clone(), EnqueueOptions::new()).await.unwrap();

        assert!(job.executed.load(Ordering::SeqCst));
        assert_eq!(driver.core().metrics().total_retried(), 2);
        assert_eq!(driver.core().metrics().total_completed(), 1);
        assert_eq!(driver.core().metrics().total_failed(), 0);
    }

    #[tokio::test]
    async fn test_absorbs_terminal_failure() {
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let core = core_with(RetryPolicy::new(2, Duration::from_millis(1)), Some(dlq.clone()));
        let driver = SyncDriver::new(core);
        let job = ProbeJob::failing("doomed", 10);

        // Enqueue succeeds even though the job dead-letters
        driver.enqueue(job, EnqueueOptions::new()).await.unwrap();

        assert_eq!(dlq.count().await.unwrap(), 1);
        assert_eq!(driver.core().metrics().total_failed(), 1);
    }
}
