//! File-backed driver: JSON persistence with in-memory selection

use super::{DriverCore, ExecutionOutcome, JobRecord, QueueDriver};
use crate::error::QueueResult;
use crate::job::{EnqueueOptions, Job};
use crate::metrics::QueueMetrics;
use crate::priority_queue::PriorityQueue;
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const JOBS_FILE: &str = "jobs.json";

/// Same selection semantics as the in-memory driver, with the pending store
/// mirrored to `<storage_path>/jobs.json` after every mutation.
///
/// The file is loaded lazily on first use; jobs whose type is no longer
/// registered are logged and skipped. Writes go through a temp file and an
/// atomic rename. Persistence failures are logged and absorbed: the
/// in-memory store stays the source of truth for the running process.
/// Cross-process ownership of the storage path is not guarded.
pub struct FileDriver {
    core: DriverCore,
    path: PathBuf,
    store: Mutex<Option<PriorityQueue>>,
}

impl FileDriver {
    pub fn new(core: DriverCore, storage_path: impl AsRef<Path>) -> Self {
        Self {
            core,
            path: storage_path.as_ref().join(JOBS_FILE),
            store: Mutex::new(None),
        }
    }

    /// Driver with a fresh registry and metrics, mostly for tests.
    pub fn with_defaults(name: &str, storage_path: impl AsRef<Path>) -> Self {
        let core = DriverCore::new(
            name,
            Arc::new(JobRegistry::new()),
            Arc::new(QueueMetrics::new()),
            None,
            RetryPolicy::default(),
        )
        .expect("non-empty driver name");
        Self::new(core, storage_path)
    }

    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    async fn load(&self, slot: &mut Option<PriorityQueue>) {
        if slot.is_some() {
            return;
        }
        let mut queue = PriorityQueue::new();
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<JobRecord>>(&bytes) {
                Ok(records) => {
                    let total = records.len();
                    let mut restored = 0usize;
                    for record in records {
                        if record.status.is_terminal() {
                            continue;
                        }
                        match self.core.registry().create(&record.job_type, &record.payload) {
                            Ok(job) => {
                                queue.add(record.into_context(job));
                                restored += 1;
                            }
                            Err(err) => {
                                warn!(
                                    path = %self.path.display(),
                                    job_type = %record.job_type,
                                    job_id = %record.id,
                                    error = %err,
                                    "skipping job with unknown or broken type"
                                );
                            }
                        }
                    }
                    info!(
                        path = %self.path.display(),
                        restored,
                        total,
                        "loaded persisted queue state"
                    );
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "corrupt queue file, starting empty"
                    );
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read queue file");
            }
        }
        *slot = Some(queue);
    }

    async fn try_persist(&self, queue: &PriorityQueue) -> QueueResult<()> {
        let records: Vec<JobRecord> = queue
            .to_sorted_list()
            .iter()
            .map(|entry| JobRecord::from_context(&entry.context))
            .collect();
        let json = serde_json::to_string_pretty(&records)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Persist-after-mutation; failures are logged, never fatal.
    async fn persist(&self, queue: &PriorityQueue) {
        if let Err(err) = self.try_persist(queue).await {
            warn!(path = %self.path.display(), error = %err, "failed to persist queue state");
        }
    }
}

#[async_trait::async_trait]
impl QueueDriver for FileDriver {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn enqueue(&self, job: Arc<dyn Job>, options: EnqueueOptions) -> QueueResult<String> {
        let ctx = self.core.new_context(job, &options);
        let id = ctx.id.clone();

        let mut slot = self.store.lock().await;
        self.load(&mut slot).await;
        let queue = slot.as_mut().expect("store loaded");
        queue.add(ctx);
        self.persist(queue).await;
        Ok(id)
    }

    async fn process_one(&self) -> QueueResult<bool> {
        let mut ctx = {
            let mut slot = self.store.lock().await;
            self.load(&mut slot).await;
            let queue = slot.as_mut().expect("store loaded");

            let mut skipped = Vec::new();
            let mut found = None;
            while let Some(entry) = queue.remove_first() {
                if entry.context.is_ready() {
                    found = Some(entry.context);
                    break;
                }
                skipped.push(entry);
            }
            for entry in skipped {
                queue.add_entry(entry);
            }
            match found {
                Some(ctx) => ctx,
                None => return Ok(false),
            }
        };

        let outcome = self.core.execute(&mut ctx).await;

        let mut slot = self.store.lock().await;
        self.load(&mut slot).await;
        let queue = slot.as_mut().expect("store loaded");
        if let ExecutionOutcome::Retried(_) = outcome {
            queue.add(ctx);
        }
        self.persist(queue).await;
        Ok(true)
    }

    async fn queue_depth(&self) -> usize {
        let mut slot = self.store.lock().await;
        self.load(&mut slot).await;
        slot.as_ref().map_or(0, PriorityQueue::len)
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut slot = self.store.lock().await;
        self.load(&mut slot).await;
        let queue = slot.as_mut().expect("store loaded");
        queue.clear();
        self.persist(queue).await;
        Ok(())
    }

    async fn dispose(&self) -> QueueResult<()> {
        let mut slot = self.store.lock().await;
        if let Some(queue) = slot.as_ref() {
            self.try_persist(queue).await?;
        }
        *slot = None;
        Ok(())
    }

    async fn stats(&self) -> Map<String, Value> {
        let depth = self.queue_depth().await;
        let mut stats = self.core.base_stats(depth);
        stats.insert(
            "storage_path".into(),
            Value::String(self.path.display().to_string()),
        );
        stats
    }
}
