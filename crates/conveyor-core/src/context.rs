//! Runtime envelope around an enqueued job

use crate::job::{EnqueueOptions, Job, JobPriority, JobStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Runtime envelope around a job, owned by its driver from enqueue until a
/// terminal outcome.
#[derive(Clone)]
pub struct JobContext {
    /// Unique per enqueue
    pub id: String,

    /// The job instance
    pub job: Arc<dyn Job>,

    /// Effective priority (enqueue option, falling back to the job's own)
    pub priority: JobPriority,

    /// Instant of enqueue
    pub queued_at: DateTime<Utc>,

    /// Instant before which the job is not ready
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Current lifecycle status
    pub status: JobStatus,

    /// Count of execution attempts (starts at 0)
    pub attempts: u32,

    /// Last failure message
    pub error: Option<String>,

    /// Last failure stack trace, when available
    pub stack_trace: Option<String>,

    /// Free-form metadata, shared with middleware
    pub metadata: Map<String, Value>,
}

impl JobContext {
    /// Create a fresh pending context from a job and its enqueue options.
    pub fn new(job: Arc<dyn Job>, options: &EnqueueOptions) -> Self {
        let now = Utc::now();
        let scheduled_for = options
            .delay
            .filter(|d| !d.is_zero())
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| now + d);

        Self {
            id: Uuid::new_v4().to_string(),
            priority: options.priority.unwrap_or_else(|| job.priority()),
            metadata: job.metadata(),
            job,
            queued_at: now,
            scheduled_for,
            status: JobStatus::Pending,
            attempts: 0,
            error: None,
            stack_trace: None,
        }
    }

    /// Pending and past its scheduled time (if any).
    pub fn is_ready(&self) -> bool {
        self.status == JobStatus::Pending
            && self
                .scheduled_for
                .map_or(true, |at| Utc::now() >= at)
    }

    /// Mark the start of an execution attempt.
    pub fn mark_started(&mut self) {
        self.status = JobStatus::Processing;
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
    }

    /// Record a failed attempt without deciding its fate yet.
    pub fn record_failure(&mut self, error: String, stack_trace: Option<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.stack_trace = stack_trace;
    }

    /// Return the context to pending, ready again after `delay`.
    pub fn schedule_retry(&mut self, delay: std::time::Duration) {
        self.scheduled_for = ChronoDuration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        self.status = JobStatus::Pending;
    }

    pub fn mark_dead_lettered(&mut self) {
        self.status = JobStatus::DeadLettered;
    }

    /// Whether this was the first execution attempt.
    pub fn is_first_attempt(&self) -> bool {
        self.attempts == 1
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id)
            .field("job_type", &self.job.job_type())
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("queued_at", &self.queued_at)
            .field("scheduled_for", &self.scheduled_for)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueResult;
    use std::time::Duration;

    #[derive(Debug)]
    struct NoopJob;

    #[async_trait::async_trait]
    impl Job for NoopJob {
        fn job_type(&self) -> &str {
            "noop"
        }

        async fn handle(&self) -> QueueResult<()> {
            Ok(())
        }

        fn to_map(&self) -> Map<String, Value> {
            Map::new()
        }
    }

    #[test]
    fn test_new_context_defaults() {
        let ctx = JobContext::new(Arc::new(NoopJob), &EnqueueOptions::new());
        assert_eq!(ctx.status, JobStatus::Pending);
        assert_eq!(ctx.attempts, 0);
        assert_eq!(ctx.priority, JobPriority::Normal);
        assert!(ctx.scheduled_for.is_none());
        assert!(ctx.is_ready());
    }

    #[test]
    fn test_delayed_context_not_ready() {
        let options = EnqueueOptions::new().with_delay(Duration::from_secs(60));
        let ctx = JobContext::new(Arc::new(NoopJob), &options);
        assert!(ctx.scheduled_for.is_some());
        assert!(!ctx.is_ready());
    }

    #[test]
    fn test_zero_delay_is_immediate() {
        let options = EnqueueOptions::new().with_delay(Duration::ZERO);
        let ctx = JobContext::new(Arc::new(NoopJob), &options);
        assert!(ctx.scheduled_for.is_none());
        assert!(ctx.is_ready());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut ctx = JobContext::new(Arc::new(NoopJob), &EnqueueOptions::new());

        ctx.mark_started();
        assert_eq!(ctx.status, JobStatus::Processing);
        assert_eq!(ctx.attempts, 1);
        assert!(ctx.is_first_attempt());
        assert!(!ctx.is_ready());

        ctx.record_failure("boom".to_string(), None);
        assert_eq!(ctx.status, JobStatus::Failed);
        assert_eq!(ctx.error.as_deref(), Some("boom"));

        ctx.schedule_retry(Duration::from_secs(30));
        assert_eq!(ctx.status, JobStatus::Pending);
        assert!(!ctx.is_ready());

        ctx.mark_started();
        assert_eq!(ctx.attempts, 2);
        assert!(!ctx.is_first_attempt());

        ctx.mark_completed();
        assert!(ctx.status.is_terminal());
    }
}
