//! Queue driver abstraction
//!
//! A driver owns job contexts from enqueue to terminal outcome. The shared
//! [`DriverCore`] implements the lifecycle every variant follows: context
//! construction, middleware execution, and the success / retry / dead-letter
//! bookkeeping. Metrics and the dead-letter store are injected ports; the
//! core never names their concrete implementations.

pub mod connection;
pub mod file;
pub mod memory;
pub mod redis;
pub mod sync;

pub use self::redis::RedisDriver;
pub use connection::RedisConnectionPool;
pub use file::FileDriver;
pub use memory::MemoryDriver;
pub use sync::SyncDriver;

use crate::config::DriverConfig;
use crate::context::JobContext;
use crate::dead_letter::{DeadLetterStore, FailedJob};
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueOptions, Job};
use crate::metrics::QueueMetrics;
use crate::middleware::{
    JobExecutionContext, LoggingMiddleware, MiddlewarePipeline, TimingMiddleware,
};
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// A backend implementation of the queue contract.
#[async_trait::async_trait]
pub trait QueueDriver: Send + Sync {
    /// Driver name (unique within a registry).
    fn name(&self) -> &str;

    /// Enqueue a job. Failures here surface to the caller.
    /// Returns the id of the created job context.
    async fn enqueue(&self, job: Arc<dyn Job>, options: EnqueueOptions) -> QueueResult<String>;

    /// Process the next ready job, if any. Returns `false` when nothing was
    /// ready. Handler failures are absorbed (retried or dead-lettered) and
    /// never surface here.
    async fn process_one(&self) -> QueueResult<bool>;

    /// Number of pending contexts.
    async fn queue_depth(&self) -> usize;

    /// Drop all pending contexts.
    async fn clear(&self) -> QueueResult<()>;

    /// Release resources (flush pending persistence, close connections).
    async fn dispose(&self) -> QueueResult<()>;

    /// Driver-specific counters merged with the shared metrics snapshot.
    async fn stats(&self) -> Map<String, Value>;
}

/// Persisted form of a job context, shared by the file driver's on-disk
/// array and the redis driver's wire values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobRecord {
    pub id: String,
    pub job_type: String,
    pub payload: Map<String, Value>,
    pub queued_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub status: crate::job::JobStatus,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
}

impl JobRecord {
    pub fn from_context(ctx: &JobContext) -> Self {
        let mut metadata = ctx.metadata.clone();
        // The enqueue-time priority override travels in metadata so it
        // survives a restart; the schema itself has no priority field.
        if ctx.priority != ctx.job.priority() {
            metadata.insert("priority".into(), Value::String(ctx.priority.to_string()));
        }
        Self {
            id: ctx.id.clone(),
            job_type: ctx.job.job_type().to_string(),
            payload: ctx.job.to_map(),
            queued_at: ctx.queued_at,
            scheduled_for: ctx.scheduled_for,
            attempts: ctx.attempts,
            status: ctx.status,
            metadata,
            error: ctx.error.clone(),
            stack_trace: ctx.stack_trace.clone(),
        }
    }

    pub fn into_context(self, job: Arc<dyn Job>) -> JobContext {
        let priority = self
            .metadata
            .get("priority")
            .and_then(Value::as_str)
            .and_then(crate::job::JobPriority::parse)
            .unwrap_or_else(|| job.priority());
        JobContext {
            id: self.id,
            priority,
            job,
            queued_at: self.queued_at,
            scheduled_for: self.scheduled_for,
            // A record caught mid-processing by a crash runs again
            status: crate::job::JobStatus::Pending,
            attempts: self.attempts,
            error: self.error,
            stack_trace: self.stack_trace,
            metadata: self.metadata,
        }
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    /// Rescheduled; ready again after the given delay.
    Retried(Duration),
    DeadLettered,
}

/// State and behavior shared by every driver variant.
pub struct DriverCore {
    name: String,
    registry: Arc<JobRegistry>,
    metrics: Arc<QueueMetrics>,
    dead_letter: Option<Arc<dyn DeadLetterStore>>,
    retry: RetryPolicy,
    pipeline: MiddlewarePipeline,
}

impl DriverCore {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<JobRegistry>,
        metrics: Arc<QueueMetrics>,
        dead_letter: Option<Arc<dyn DeadLetterStore>>,
        retry: RetryPolicy,
    ) -> QueueResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(QueueError::Validation("driver name is empty".into()));
        }
        Ok(Self {
            name,
            registry,
            metrics,
            dead_letter,
            retry,
            pipeline: MiddlewarePipeline::new(),
        })
    }

    /// Core configured from a [`DriverConfig`]: retry override plus the
    /// logging/timing middleware toggles.
    pub fn from_config(
        name: impl Into<String>,
        registry: Arc<JobRegistry>,
        metrics: Arc<QueueMetrics>,
        dead_letter: Option<Arc<dyn DeadLetterStore>>,
        config: &DriverConfig,
        fallback_retry: RetryPolicy,
    ) -> QueueResult<Self> {
        let dead_letter = if config.use_dead_letter {
            dead_letter
        } else {
            None
        };
        let mut core = Self::new(
            name,
            registry,
            metrics,
            dead_letter,
            config.retry.clone().unwrap_or(fallback_retry),
        )?;
        if config.logging {
            core.pipeline.add(Arc::new(LoggingMiddleware::default()));
        }
        if config.timing {
            core.pipeline.add(Arc::new(TimingMiddleware::new()));
        }
        Ok(core)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn pipeline_mut(&mut self) -> &mut MiddlewarePipeline {
        &mut self.pipeline
    }

    /// Build a fresh pending context and record the enqueue.
    pub fn new_context(&self, job: Arc<dyn Job>, options: &EnqueueOptions) -> JobContext {
        let ctx = JobContext::new(job, options);
        self.record_enqueued(&ctx);
        ctx
    }

    /// Build a context without recording it yet. For drivers whose enqueue
    /// can fail after construction (network push); pair with
    /// [`record_enqueued`](Self::record_enqueued) once the job is stored.
    pub fn prepare_context(&self, job: Arc<dyn Job>, options: &EnqueueOptions) -> JobContext {
        JobContext::new(job, options)
    }

    /// Record a successfully stored enqueue.
    pub fn record_enqueued(&self, ctx: &JobContext) {
        self.metrics.job_queued(ctx.job.job_type(), ctx.priority);
        debug!(
            driver = %self.name,
            job_id = %ctx.id,
            job_type = ctx.job.job_type(),
            priority = %ctx.priority,
            "job enqueued"
        );
    }

    /// Run one execution attempt through the middleware pipeline and apply
    /// the shared outcome bookkeeping. The context reflects the outcome on
    /// return; the caller only decides what to do with it in its store.
    pub async fn execute(&self, ctx: &mut JobContext) -> ExecutionOutcome {
        ctx.mark_started();
        if ctx.is_first_attempt() {
            self.metrics.job_started();
        }

        let mut exec = JobExecutionContext::new(Arc::clone(&ctx.job), ctx.id.clone())
            .with_metadata(ctx.metadata.clone());
        let result = self.pipeline.execute(&mut exec).await;
        let elapsed = exec.elapsed();
        ctx.metadata = exec.metadata;

        match result {
            Ok(()) => {
                ctx.mark_completed();
                self.metrics
                    .job_completed(ctx.job.job_type(), elapsed, ctx.priority);
                debug!(driver = %self.name, job_id = %ctx.id, "job completed");
                ExecutionOutcome::Completed
            }
            Err(err) => self.handle_failure(ctx, err).await,
        }
    }

    async fn handle_failure(&self, ctx: &mut JobContext, err: QueueError) -> ExecutionOutcome {
        let stack_trace = ctx
            .metadata
            .get("stack_trace")
            .and_then(Value::as_str)
            .map(str::to_owned);
        ctx.record_failure(err.to_string(), stack_trace);

        if self.retry.allows_retry(ctx.attempts) {
            let delay = self.retry.delay_for(ctx.attempts);
            ctx.schedule_retry(delay);
            self.metrics.job_retried(ctx.job.job_type());
            debug!(
                driver = %self.name,
                job_id = %ctx.id,
                attempts = ctx.attempts,
                delay_ms = delay.as_millis() as u64,
                "job scheduled for retry"
            );
            ExecutionOutcome::Retried(delay)
        } else {
            ctx.mark_dead_lettered();
            if err.is_timeout() {
                self.metrics.job_timed_out(ctx.job.job_type());
            } else {
                self.metrics.job_failed(ctx.job.job_type(), ctx.priority);
            }
            warn!(
                driver = %self.name,
                job_id = %ctx.id,
                attempts = ctx.attempts,
                error = %err,
                "job exhausted its retry budget"
            );
            if let Some(dead_letter) = &self.dead_letter {
                if let Err(store_err) = dead_letter.store(self.failed_job(ctx)).await {
                    warn!(
                        driver = %self.name,
                        job_id = %ctx.id,
                        error = %store_err,
                        "failed to store dead-lettered job"
                    );
                }
            }
            ExecutionOutcome::DeadLettered
        }
    }

    /// Terminal failure snapshot for the dead-letter store.
    pub fn failed_job(&self, ctx: &JobContext) -> FailedJob {
        FailedJob {
            id: ctx.id.clone(),
            job_type: ctx.job.job_type().to_string(),
            payload: self.registry.serialize(ctx.job.as_ref()),
            error: ctx.error.clone().unwrap_or_default(),
            stack_trace: ctx.stack_trace.clone(),
            failed_at: Utc::now(),
            attempts: ctx.attempts,
            metadata: ctx.metadata.clone(),
        }
    }

    /// Shared stats every variant reports, merged with the metrics snapshot.
    pub fn base_stats(&self, queue_depth: usize) -> Map<String, Value> {
        self.metrics.record_queue_depth(queue_depth as u64);
        let mut stats = self.metrics.to_map();
        stats.insert("driver".into(), Value::String(self.name.clone()));
        stats.insert("queue_depth".into(), Value::from(queue_depth as u64));
        stats
    }
}

/// Named drivers with an optional default, for embedders running several
/// backends side by side.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn QueueDriver>>>,
    default: RwLock<Option<String>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own name. The first registration becomes
    /// the default.
    pub fn register(&self, driver: Arc<dyn QueueDriver>) -> QueueResult<()> {
        let name = driver.name().to_string();
        if name.is_empty() {
            return Err(QueueError::Validation("driver name is empty".into()));
        }
        let mut drivers = self.drivers.write().expect("driver registry lock poisoned");
        if drivers.contains_key(&name) {
            return Err(QueueError::DriverAlreadyRegistered(name));
        }
        drivers.insert(name.clone(), driver);

        let mut default = self.default.write().expect("driver registry lock poisoned");
        if default.is_none() {
            *default = Some(name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> QueueResult<Arc<dyn QueueDriver>> {
        self.drivers
            .read()
            .expect("driver registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::DriverNotFound(name.to_string()))
    }

    /// Make a registered driver the default.
    pub fn set_default(&self, name: &str) -> QueueResult<()> {
        if !self
            .drivers
            .read()
            .expect("driver registry lock poisoned")
            .contains_key(name)
        {
            return Err(QueueError::DriverNotFound(name.to_string()));
        }
        *self.default.write().expect("driver registry lock poisoned") = Some(name.to_string());
        Ok(())
    }

    pub fn default_driver(&self) -> QueueResult<Arc<dyn QueueDriver>> {
        let name = self
            .default
            .read()
            .expect("driver registry lock poisoned")
            .clone()
            .ok_or(QueueError::NoDefaultDriver)?;
        self.get(&name)
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers
            .read()
            .expect("driver registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::QueueResult;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Test job with observable execution state.
    pub struct ProbeJob {
        pub label: String,
        pub executed: Arc<AtomicBool>,
        pub failures: AtomicU32,
    }

    impl ProbeJob {
        pub fn new(label: &str) -> (Arc<Self>, Arc<AtomicBool>) {
            let executed = Arc::new(AtomicBool::new(false));
            (
                Arc::new(Self {
                    label: label.to_string(),
                    executed: executed.clone(),
                    failures: AtomicU32::new(0),
                }),
                executed,
            )
        }

        pub fn failing(label: &str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                executed: Arc::new(AtomicBool::new(false)),
                failures: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait::async_trait]
    impl Job for ProbeJob {
        fn job_type(&self) -> &str {
            "probe"
        }

        fn display_name(&self) -> String {
            self.label.clone()
        }

        async fn handle(&self) -> QueueResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::Handler("fail".into()));
            }
            self.executed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn to_map(&self) -> Map<String, Value> {
            let mut map = Map::new();
            map.insert("label".into(), Value::String(self.label.clone()));
            map
        }
    }

    pub fn core_with(
        retry: RetryPolicy,
        dead_letter: Option<Arc<dyn DeadLetterStore>>,
    ) -> DriverCore {
        DriverCore::new(
            "test",
            Arc::new(JobRegistry::new()),
            Arc::new(QueueMetrics::new()),
            dead_letter,
            retry,
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::dead_letter::InMemoryDeadLetterQueue;
    use crate::job::JobPriority;

    #[tokio::test]
    async fn test_execute_success_path() {
        let core = core_with(RetryPolicy::default(), None);
        let (job, executed) = ProbeJob::new("a");
        let mut ctx = core.new_context(job, &EnqueueOptions::new());

        let outcome = core.execute(&mut ctx).await;
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert!(executed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(core.metrics().total_completed(), 1);
        assert_eq!(core.metrics().currently_processing(), 0);
    }

    #[tokio::test]
    async fn test_execute_retry_then_dead_letter() {
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let retry = RetryPolicy::new(2, Duration::from_millis(1));
        let core = core_with(retry, Some(dlq.clone()));

        let job = ProbeJob::failing("doomed", 10);
        let mut ctx = core.new_context(job, &EnqueueOptions::new());

        match core.execute(&mut ctx).await {
            ExecutionOutcome::Retried(delay) => assert_eq!(delay, Duration::from_millis(1)),
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(core.metrics().total_retried(), 1);
        // Still processing while awaiting the retry
        assert_eq!(core.metrics().currently_processing(), 1);

        ctx.scheduled_for = None;
        let outcome = core.execute(&mut ctx).await;
        assert_eq!(outcome, ExecutionOutcome::DeadLettered);
        assert_eq!(core.metrics().total_failed(), 1);
        assert_eq!(core.metrics().currently_processing(), 0);

        let records = dlq.get_all(None, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, ctx.id);
        assert_eq!(records[0].attempts, 2);
        assert!(records[0].error.contains("fail"));
    }

    #[tokio::test]
    async fn test_enqueue_records_metric() {
        let core = core_with(RetryPolicy::default(), None);
        let (job, _) = ProbeJob::new("a");
        let _ctx = core.new_context(
            job,
            &EnqueueOptions::new().with_priority(JobPriority::Critical),
        );
        assert_eq!(core.metrics().total_queued(), 1);
    }

    #[tokio::test]
    async fn test_driver_registry() {
        use crate::drivers::sync::SyncDriver;

        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.default_driver(),
            Err(QueueError::NoDefaultDriver)
        ));

        let driver: Arc<dyn QueueDriver> = Arc::new(SyncDriver::with_defaults("sync"));
        registry.register(driver.clone()).unwrap();
        assert!(registry.get("sync").is_ok());
        assert_eq!(registry.default_driver().unwrap().name(), "sync");

        let err = registry.register(driver).unwrap_err();
        assert!(matches!(err, QueueError::DriverAlreadyRegistered(_)));

        assert!(matches!(
            registry.get("missing"),
            Err(QueueError::DriverNotFound(_))
        ));
        assert!(matches!(
            registry.set_default("missing"),
            Err(QueueError::DriverNotFound(_))
        ));
    }

    #[test]
    fn test_empty_driver_name_rejected() {
        let result = DriverCore::new(
            "",
            Arc::new(JobRegistry::new()),
            Arc::new(QueueMetrics::new()),
            None,
            RetryPolicy::default(),
        );
        assert!(matches!(result, Err(QueueError::Validation(_))));
    }
}
