//! In-memory driver

use super::{DriverCore, ExecutionOutcome, QueueDriver};
use crate::error::QueueResult;
use crate::job::{EnqueueOptions, Job};
use crate::metrics::QueueMetrics;
use crate::priority_queue::PriorityQueue;
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Priority-ordered in-process store with ready-time filtering.
///
/// The store mutex is the driver's single ownership gate: selecting the next
/// ready context and taking it out of the queue happens under one lock, so
/// concurrent `process_one` callers never pick the same job. Execution runs
/// outside the lock.
pub struct MemoryDriver {
    core: DriverCore,
    store: Mutex<PriorityQueue>,
}

impl MemoryDriver {
    pub fn new(core: DriverCore) -> Self {
        Self {
            core,
            store: Mutex::new(PriorityQueue::new()),
        }
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
        Self::new(core)
    }

    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    /// Pop the highest-priority ready context, restoring the ones that were
    /// skipped because their scheduled time hasn't arrived.
    async fn take_next_ready(&self) -> Option<crate::context::JobContext> {
        let mut store = self.store.lock().await;
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(entry) = store.remove_first() {
            if entry.context.is_ready() {
                found = Some(entry.context);
                break;
            }
            skipped.push(entry);
        }
        for entry in skipped {
            store.add_entry(entry);
        }
        found
    }
}

#[async_trait::async_trait]
impl QueueDriver for MemoryDriver {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn enqueue(&self, job: Arc<dyn Job>, options: EnqueueOptions) -> QueueResult<String> {
        let ctx = self.core.new_context(job, &options);
        let id = ctx.id.clone();
        self.store.lock().await.add(ctx);
        Ok(id)
    }

    async fn process_one(&self) -> QueueResult<bool> {
        let mut ctx = match self.take_next_ready().await {
            Some(ctx) => ctx,
            None => return Ok(false),
        };

        match self.core.execute(&mut ctx).await {
            // Terminal outcomes drop the context; it was already removed.
            ExecutionOutcome::Completed | ExecutionOutcome::DeadLettered => {}
            ExecutionOutcome::Retried(_) => {
                self.store.lock().await.add(ctx);
            }
        }
        Ok(true)
    }

    async fn queue_depth(&self) -> usize {
        self.store.lock().await.len()
    }

    async fn clear(&self) -> QueueResult<()> {
        self.store.lock().await.clear();
        Ok(())
    }

    async fn dispose(&self) -> QueueResult<()> {
        self.clear().await
    }

    async fn stats(&self) -> Map<String, Value> {
        let depth = self.queue_depth().await;
        self.core.base_stats(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetterQueue};
    use crate::job::JobPriority;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_enqueue_then_process() {
        let driver = MemoryDriver::with_defaults("memory");
        let (job, executed) = ProbeJob::new("a");

        driver.enqueue(job, EnqueueOptions::new()).await.unwrap();
        assert_eq!(driver.queue_depth().await, 1);
        assert!(!executed.load(Ordering::SeqCst));

        assert!(driver.process_one().await.unwrap());
        assert!(executed.load(Ordering::SeqCst));
        assert_eq!(driver.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn test_process_empty_returns_false() {
        let driver = MemoryDriver::with_defaults("memory");
        assert!(!driver.process_one().await.unwrap());
    }

    #[tokio::test]
    async fn test_priority_selection() {
        let driver = MemoryDriver::with_defaults("memory");
        let (low, low_done) = ProbeJob::new("low");
        let (critical, critical_done) = ProbeJob::new("critical");
        let (high, high_done) = ProbeJob::new("high");

        for (job, priority) in [
            (low, JobPriority::Low),
            (critical, JobPriority::Critical),
            (high, JobPriority::High),
        ] {
            driver
                .enqueue(job, EnqueueOptions::new().with_priority(priority))
                .await
                .unwrap();
        }

        driver.process_one().await.unwrap();
        assert!(critical_done.load(Ordering::SeqCst));
        assert!(!high_done.load(Ordering::SeqCst));

        driver.process_one().await.unwrap();
        assert!(high_done.load(Ordering::SeqCst));
        assert!(!low_done.load(Ordering::SeqCst));

        driver.process_one().await.unwrap();
        assert!(low_done.load(Ordering::SeqCst));

        let metrics = driver.core().metrics();
        assert_eq!(metrics.completed_for_priority(JobPriority::Critical), 1);
        assert_eq!(metrics.completed_for_priority(JobPriority::High), 1);
        assert_eq!(metrics.completed_for_priority(JobPriority::Low), 1);
    }

    #[tokio::test]
    async fn test_delayed_job_skipped_until_ready() {
        let driver = MemoryDriver::with_defaults("memory");
        let (slow, slow_done) = ProbeJob::new("slow");
        let (fast, fast_done) = ProbeJob::new("fast");

        driver
            .enqueue(
                slow,
                EnqueueOptions::new().with_delay(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        driver.enqueue(fast, EnqueueOptions::new()).await.unwrap();

        // First pass: only the undelayed job is ready
        assert!(driver.process_one().await.unwrap());
        assert!(fast_done.load(Ordering::SeqCst));
        assert!(!slow_done.load(Ordering::SeqCst));
        assert_eq!(driver.queue_depth().await, 1);

        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(driver.process_one().await.unwrap());
        assert!(slow_done.load(Ordering::SeqCst));
        assert_eq!(driver.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn test_retry_reschedules() {
        let core = core_with(RetryPolicy::new(3, Duration::from_millis(10)), None);
        let driver = MemoryDriver::new(core);
        let job = ProbeJob::failing("flaky", 1);

        driver.enqueue(job.clone(), EnqueueOptions::new()).await.unwrap();
        assert!(driver.process_one().await.unwrap());

        // Failed attempt went back into the store, delayed
        assert_eq!(driver.queue_depth().await, 1);
        assert!(!driver.process_one().await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(driver.process_one().await.unwrap());
        assert!(job.executed.load(Ordering::SeqCst));
        assert_eq!(driver.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_removes_and_dead_letters() {
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let core = core_with(RetryPolicy::new(1, Duration::from_millis(1)), Some(dlq.clone()));
        let driver = MemoryDriver::new(core);

        driver
            .enqueue(ProbeJob::failing("doomed", 5), EnqueueOptions::new())
            .await
            .unwrap();
        assert!(driver.process_one().await.unwrap());

        assert_eq!(driver.queue_depth().await, 0);
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let driver = MemoryDriver::with_defaults("memory");
        let (job, _) = ProbeJob::new("a");
        driver.enqueue(job, EnqueueOptions::new()).await.unwrap();
        driver.clear().await.unwrap();
        assert_eq!(driver.queue_depth().await, 0);
    }
}
