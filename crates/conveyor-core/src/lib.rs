//! Background job queue runtime
//!
//! This crate provides a pluggable job-processing subsystem:
//! - Self-serializing jobs with a type-name registry for reconstruction
//! - Pluggable drivers: synchronous, in-memory, file-backed, Redis
//! - Composable middleware (retry, timeout, rate-limit, dedupe, logging,
//!   timing, error handling)
//! - Priority scheduling with FIFO delivery within a level
//! - Worker pools with graceful shutdown and dynamic scaling
//! - Rolling metrics with Prometheus export
//! - Dead-letter storage for jobs that exhaust their retry budget
//!
//! ## Architecture
//!
//! Producers enqueue jobs on a driver; the driver wraps each job in a
//! context (id, status, timestamps, attempt count) and owns it until a
//! terminal outcome. Workers repeatedly call `process_one`, which selects
//! the next ready context, runs it through the driver's middleware pipeline,
//! and applies the retry / dead-letter policy on failure. Metrics and the
//! dead-letter store are injected ports, so drivers stay decoupled from
//! their concrete implementations.

pub mod config;
pub mod context;
pub mod dead_letter;
pub mod drivers;
pub mod error;
pub mod job;
pub mod metrics;
pub mod middleware;
pub mod priority_queue;
pub mod registry;
pub mod retry;
pub mod worker;

// Re-export main types
pub use config::{DriverConfig, QueueConfig, WorkerSettings};
pub use context::JobContext;
pub use dead_letter::{
    DeadLetterStore, DlqStats, FailedJob, FileDeadLetterQueue, InMemoryDeadLetterQueue,
};
pub use drivers::{
    DriverCore, DriverRegistry, ExecutionOutcome, FileDriver, MemoryDriver, QueueDriver,
    RedisConnectionPool, RedisDriver, SyncDriver,
};
pub use error::{QueueError, QueueResult};
pub use job::{EnqueueOptions, Job, JobPriority, JobStatus};
pub use metrics::QueueMetrics;
pub use middleware::{
    ConditionalMiddleware, DeduplicationMiddleware, ErrorHandlingMiddleware, HookMiddleware,
    JobExecutionContext, LogSink, LoggingMiddleware, Middleware, MiddlewarePipeline, Next,
    RateLimitMiddleware, RetryMiddleware, TimeoutMiddleware, TimingMiddleware, TracingLogSink,
};
pub use priority_queue::{PrioritizedJob, PriorityQueue};
pub use registry::{JobRegistry, DEFAULT_REGISTRY};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use worker::{Worker, WorkerId, WorkerOptions, WorkerPool, WorkerState};

/// Current crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
