//! Workers and worker pools consuming from a shared driver

use crate::config::WorkerSettings;
use crate::drivers::QueueDriver;
use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique worker identifier
pub type WorkerId = Uuid;

type OnError = Arc<dyn Fn(&QueueError) + Send + Sync>;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Stop after this many processed jobs
    pub max_jobs: Option<u64>,

    /// Delay between consecutive dequeue attempts
    pub delay: Duration,

    /// Wall-clock bound on the worker's total run
    pub timeout: Option<Duration>,

    /// How long `stop` waits for in-flight work before returning
    pub graceful_shutdown: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_jobs: None,
            delay: Duration::from_secs(1),
            timeout: None,
            graceful_shutdown: Duration::from_secs(30),
        }
    }
}

impl From<&WorkerSettings> for WorkerOptions {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            max_jobs: settings.max_jobs,
            delay: settings.delay(),
            timeout: settings.timeout(),
            graceful_shutdown: settings.graceful_shutdown(),
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not yet started
    Idle,

    /// Loop running
    Running,

    /// Shutdown requested, draining the current iteration
    Stopping,

    /// Loop exited
    Stopped,
}

/// Shared active/total gauge a pool hands to its workers so utilization
/// snapshots land in metrics on every job transition.
pub(crate) struct UtilizationGauge {
    active: AtomicUsize,
    total: AtomicUsize,
    metrics: Arc<QueueMetrics>,
}

impl UtilizationGauge {
    fn new(metrics: Arc<QueueMetrics>) -> Self {
        Self {
            active: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            metrics,
        }
    }

    fn record(&self) {
        self.metrics.record_worker_utilization(
            self.active.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        );
    }

    fn worker_started(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.record();
    }

    fn worker_stopped(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.record();
    }

    fn job_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.record();
    }

    fn job_finished(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.record();
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Cooperative consumer over one driver.
pub struct Worker {
    id: WorkerId,
    driver: Arc<dyn QueueDriver>,
    options: WorkerOptions,
    on_error: Option<OnError>,
    state: RwLock<WorkerState>,
    jobs_processed: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
    gauge: Option<Arc<UtilizationGauge>>,
    // In a process_one call right now; drives the gauge's active count
    busy: AtomicBool,
    // True until run() registers with the gauge, and again once the
    // accounting has been released (by run's exit or by abandon)
    gauge_released: AtomicBool,
}

impl Worker {
    pub fn new(driver: Arc<dyn QueueDriver>, options: WorkerOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (finished_tx, _) = watch::channel(false);
        Self {
            id: WorkerId::new_v4(),
            driver,
            options,
            on_error: None,
            state: RwLock::new(WorkerState::Idle),
            jobs_processed: AtomicU64::new(0),
            shutdown_tx,
            finished_tx,
            gauge: None,
            busy: AtomicBool::new(false),
            gauge_released: AtomicBool::new(true),
        }
    }

    /// Callback invoked when `process_one` itself fails (driver errors, not
    /// handler failures). The worker keeps running.
    pub fn with_on_error(mut self, on_error: impl Fn(&QueueError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub(crate) fn with_gauge(mut self, gauge: Arc<UtilizationGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    /// Spawn the worker loop.
    pub async fn start(self: Arc<Self>) -> JoinHandle<()> {
        *self.state.write().await = WorkerState::Running;
        info!(worker_id = %self.id, driver = self.driver.name(), "worker starting");
        let worker = Arc::clone(&self);
        tokio::spawn(async move {
            worker.run().await;
        })
    }

    fn mark_job_started(&self) {
        if let Some(gauge) = &self.gauge {
            self.busy.store(true, Ordering::SeqCst);
            gauge.job_started();
        }
    }

    fn mark_job_finished(&self) {
        if let Some(gauge) = &self.gauge {
            if self.busy.swap(false, Ordering::SeqCst) {
                gauge.job_finished();
            }
        }
    }

    /// Release this worker's slice of the utilization accounting.
    /// Idempotent, so a normal exit and an `abandon` call can race safely.
    fn release_gauge(&self) {
        if let Some(gauge) = &self.gauge {
            if !self.gauge_released.swap(true, Ordering::SeqCst) {
                if self.busy.swap(false, Ordering::SeqCst) {
                    gauge.job_finished();
                }
                gauge.worker_stopped();
            }
        }
    }

    async fn run(&self) {
        let started = Instant::now();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if let Some(gauge) = &self.gauge {
            gauge.worker_started();
            self.gauge_released.store(false, Ordering::SeqCst);
        }

        loop {
            if *shutdown_rx.borrow() {
                debug!(worker_id = %self.id, "shutdown requested");
                break;
            }
            if let Some(max_jobs) = self.options.max_jobs {
                if self.jobs_processed() >= max_jobs {
                    debug!(worker_id = %self.id, max_jobs, "job cap reached");
                    break;
                }
            }
            if let Some(timeout) = self.options.timeout {
                if started.elapsed() >= timeout {
                    debug!(worker_id = %self.id, "run timeout reached");
                    break;
                }
            }

            self.mark_job_started();
            let result = self.driver.process_one().await;
            self.mark_job_finished();

            match result {
                Ok(true) => {
                    self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "process_one failed");
                    if let Some(on_error) = &self.on_error {
                        on_error(&err);
                    }
                }
            }

            tokio::select! {
                _ = sleep(self.options.delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.release_gauge();
        *self.state.write().await = WorkerState::Stopped;
        let _ = self.finished_tx.send(true);
        info!(worker_id = %self.id, processed = self.jobs_processed(), "worker stopped");
    }

    /// Finalize a worker whose task is about to be aborted after `stop`
    /// timed out: release its utilization accounting and mark it stopped.
    /// Without this, aborting the task mid-`process_one` would leave the
    /// gauge's active/total counts raised forever.
    async fn abandon(&self) {
        warn!(worker_id = %self.id, "worker abandoned after graceful timeout");
        self.release_gauge();
        *self.state.write().await = WorkerState::Stopped;
        let _ = self.finished_tx.send(true);
    }

    /// Request shutdown and wait for the loop to drain, up to the graceful
    /// timeout. Returns `true` when the worker finished in time; in-flight
    /// work may keep running in the background otherwise.
    pub async fn stop(&self) -> bool {
        {
            let mut state = self.state.write().await;
            if *state == WorkerState::Stopped {
                return true;
            }
            if *state == WorkerState::Idle {
                *state = WorkerState::Stopped;
                return true;
            }
            *state = WorkerState::Stopping;
        }
        let _ = self.shutdown_tx.send(true);

        let mut finished = self.finished_tx.subscribe();
        tokio::time::timeout(self.options.graceful_shutdown, async move {
            while !*finished.borrow_and_update() {
                if finished.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Worker-level counters.
    pub async fn stats(&self) -> Map<String, Value> {
        let mut stats = Map::new();
        stats.insert("worker_id".into(), Value::String(self.id.to_string()));
        stats.insert(
            "state".into(),
            Value::String(format!("{:?}", self.state().await).to_lowercase()),
        );
        stats.insert("jobs_processed".into(), Value::from(self.jobs_processed()));
        stats
    }
}

/// Fixed-size set of workers sharing one driver.
pub struct WorkerPool {
    driver: Arc<dyn QueueDriver>,
    options: WorkerOptions,
    gauge: Arc<UtilizationGauge>,
    workers: Mutex<Vec<(Arc<Worker>, JoinHandle<()>)>>,
    desired: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        driver: Arc<dyn QueueDriver>,
        worker_count: usize,
        options: WorkerOptions,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            driver,
            options,
            gauge: Arc::new(UtilizationGauge::new(metrics)),
            workers: Mutex::new(Vec::new()),
            desired: AtomicUsize::new(worker_count),
        }
    }

    /// Launch the configured number of workers.
    pub async fn start(&self) {
        let desired = self.desired.load(Ordering::Relaxed);
        let mut workers = self.workers.lock().await;
        while workers.len() < desired {
            let worker = Arc::new(
                Worker::new(Arc::clone(&self.driver), self.options.clone())
                    .with_gauge(Arc::clone(&self.gauge)),
            );
            let handle = Arc::clone(&worker).start().await;
            workers.push((worker, handle));
        }
        info!(workers = workers.len(), driver = self.driver.name(), "worker pool started");
    }

    /// Stop the given workers concurrently, so the total wait is bounded by
    /// one graceful-shutdown period rather than one per worker. Workers that
    /// don't drain in time are abandoned and their tasks aborted.
    async fn shut_down(workers: Vec<(Arc<Worker>, JoinHandle<()>)>) {
        let stops = workers
            .iter()
            .map(|(worker, _)| {
                let worker = Arc::clone(worker);
                async move { worker.stop().await }
            })
            .collect::<Vec<_>>();
        let drained = join_all(stops).await;

        for ((worker, handle), drained) in workers.into_iter().zip(drained) {
            if !drained {
                worker.abandon().await;
            }
            handle.abort();
        }
    }

    /// Adjust the pool to `count` workers: excess workers are stopped,
    /// shortfall is launched.
    pub async fn scale(&self, count: usize) {
        self.desired.store(count, Ordering::Relaxed);
        let mut workers = self.workers.lock().await;

        if workers.len() > count {
            let excess = workers.split_off(count);
            Self::shut_down(excess).await;
        }
        while workers.len() < count {
            let worker = Arc::new(
                Worker::new(Arc::clone(&self.driver), self.options.clone())
                    .with_gauge(Arc::clone(&self.gauge)),
            );
            let handle = Arc::clone(&worker).start().await;
            workers.push((worker, handle));
        }
        info!(workers = workers.len(), "worker pool scaled");
    }

    /// Stop every worker; returns when all have drained or one
    /// graceful-shutdown period has elapsed.
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        let all = workers.drain(..).collect::<Vec<_>>();
        Self::shut_down(all).await;
        info!("worker pool stopped");
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Pool counters merged with the driver's stats.
    pub async fn stats(&self) -> Map<String, Value> {
        let mut stats = self.driver.stats().await;
        stats.insert(
            "worker_count".into(),
            Value::from(self.worker_count().await as u64),
        );
        stats.insert(
            "active_workers".into(),
            Value::from(self.gauge.active() as u64),
        );
        stats
    }
}
