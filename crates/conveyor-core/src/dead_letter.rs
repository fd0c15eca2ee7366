//! Dead-letter queue for jobs that exhausted their retry budget

use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Immutable snapshot of a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub id: String,
    pub job_type: String,
    pub payload: Map<String, Value>,
    pub error: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Aggregate counts over a dead-letter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
}

/// Terminal failure storage. One store per driver; access is serialized
/// per operation.
#[async_trait::async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(&self, failed: FailedJob) -> QueueResult<()>;

    async fn get(&self, id: &str) -> QueueResult<Option<FailedJob>>;

    /// Records in failure order, optionally paginated.
    async fn get_all(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> QueueResult<Vec<FailedJob>>;

    async fn get_by_type(&self, job_type: &str) -> QueueResult<Vec<FailedJob>>;

    async fn get_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> QueueResult<Vec<FailedJob>>;

    /// Returns whether a record was removed.
    async fn remove(&self, id: &str) -> QueueResult<bool>;

    async fn clear(&self) -> QueueResult<()>;

    async fn count(&self) -> QueueResult<usize>;

    async fn stats(&self) -> QueueResult<DlqStats>;
}

fn page(records: &[FailedJob], limit: Option<usize>, offset: Option<usize>) -> Vec<FailedJob> {
    records
        .iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

fn stats_of(records: &[FailedJob]) -> DlqStats {
    let mut by_type: HashMap<String, usize> = HashMap::new();
    for record in records {
        *by_type.entry(record.job_type.clone()).or_insert(0) += 1;
    }
    DlqStats {
        total: records.len(),
        by_type,
    }
}

/// In-memory dead-letter queue. Records are kept in failure order.
#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    records: Mutex<Vec<FailedJob>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for InMemoryDeadLetterQueue {
    async fn store(&self, failed: FailedJob) -> QueueResult<()> {
        self.records.lock().await.push(failed);
        Ok(())
    }

    async fn get(&self, id: &str) -> QueueResult<Option<FailedJob>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn get_all(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> QueueResult<Vec<FailedJob>> {
        Ok(page(&self.records.lock().await, limit, offset))
    }

    async fn get_by_type(&self, job_type: &str) -> QueueResult<Vec<FailedJob>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.job_type == job_type)
            .cloned()
            .collect())
    }

    async fn get_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> QueueResult<Vec<FailedJob>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.failed_at >= from && r.failed_at <= to)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> QueueResult<bool> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    async fn clear(&self) -> QueueResult<()> {
        self.records.lock().await.clear();
        Ok(())
    }

    async fn count(&self) -> QueueResult<usize> {
        Ok(self.records.lock().await.len())
    }

    async fn stats(&self) -> QueueResult<DlqStats> {
        Ok(stats_of(&self.records.lock().await))
    }
}

/// File-backed dead-letter queue: a JSON array rewritten on every mutation.
///
/// The in-memory copy is the working state; it is lazily loaded on first
/// access and flushed with an atomic temp-write + rename. Write failures are
/// surfaced as `Persistence` errors to the caller of the mutation but leave
/// the in-memory state intact.
pub struct FileDeadLetterQueue {
    path: PathBuf,
    records: Mutex<Option<Vec<FailedJob>>>,
}

impl FileDeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// Store rooted in a directory, using the conventional file name.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join("failed_jobs.json"))
    }

    async fn load(&self, cache: &mut Option<Vec<FailedJob>>) -> QueueResult<()> {
        if cache.is_some() {
            return Ok(());
        }
        let records = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                error!(path = %self.path.display(), error = %e, "corrupt dead-letter file");
                QueueError::Persistence(format!("corrupt dead-letter file: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        *cache = Some(records);
        Ok(())
    }

    async fn persist(&self, records: &[FailedJob]) -> QueueResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn with_records<T>(
        &self,
        f: impl FnOnce(&mut Vec<FailedJob>) -> T,
        persist: bool,
    ) -> QueueResult<T> {
        let mut cache = self.records.lock().await;
        self.load(&mut cache).await?;
        let records = cache.as_mut().expect("records loaded");
        let out = f(records);
        if persist {
            if let Err(e) = self.persist(records).await {
                warn!(path = %self.path.display(), error = %e, "failed to persist dead-letter queue");
                return Err(e);
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for FileDeadLetterQueue {
    async fn store(&self, failed: FailedJob) -> QueueResult<()> {
        self.with_records(|records| records.push(failed), true).await
    }

    async fn get(&self, id: &str) -> QueueResult<Option<FailedJob>> {
        self.with_records(
            |records| records.iter().find(|r| r.id == id).cloned(),
            false,
        )
        .await
    }

    async fn get_all(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> QueueResult<Vec<FailedJob>> {
        self.with_records(|records| page(records, limit, offset), false)
            .await
    }

    async fn get_by_type(&self, job_type: &str) -> QueueResult<Vec<FailedJob>> {
        self.with_records(
            |records| {
                records
                    .iter()
                    .filter(|r| r.job_type == job_type)
                    .cloned()
                    .collect()
            },
            false,
        )
        .await
    }

    async fn get_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> QueueResult<Vec<FailedJob>> {
        self.with_records(
            |records| {
                records
                    .iter()
                    .filter(|r| r.failed_at >= from && r.failed_at <= to)
                    .cloned()
                    .collect()
            },
            false,
        )
        .await
    }

    async fn remove(&self, id: &str) -> QueueResult<bool> {
        self.with_records(
            |records| {
                let before = records.len();
                records.retain(|r| r.id != id);
                records.len() != before
            },
            true,
        )
        .await
    }

    async fn clear(&self) -> QueueResult<()> {
        self.with_records(|records| records.clear(), true).await
    }

    async fn count(&self) -> QueueResult<usize> {
        self.with_records(|records| records.len(), false).await
    }

    async fn stats(&self) -> QueueResult<DlqStats> {
        self.with_records(|records| stats_of(records), false).await
    }
}
