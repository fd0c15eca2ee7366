//! Network key-value driver (Redis)
//!
//! Wire layout, three keys per queue name:
//! - `queue:<name>`: ready list, LPUSH on enqueue, RPOP on dequeue (FIFO)
//! - `queue:<name>:delayed`: sorted set scored by epoch-ms ready time
//! - `queue:<name>:failed`: list of terminally failed job records
//!
//! Values are the JSON job records produced by the registry envelope.

use super::{DriverCore, ExecutionOutcome, JobRecord, QueueDriver, RedisConnectionPool};
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueOptions, Job};
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct RedisDriver {
    core: DriverCore,
    pool: RedisConnectionPool,
    queue_key: String,
    delayed_key: String,
    failed_key: String,
    connection_failures: AtomicU64,
}

impl RedisDriver {
    pub fn new(core: DriverCore, pool: RedisConnectionPool, queue_name: &str) -> QueueResult<Self> {
        if queue_name.is_empty() {
            return Err(QueueError::Validation("queue name is empty".into()));
        }
        Ok(Self {
            core,
            pool,
            queue_key: format!("queue:{queue_name}"),
            delayed_key: format!("queue:{queue_name}:delayed"),
            failed_key: format!("queue:{queue_name}:failed"),
            connection_failures: AtomicU64::new(0),
        })
    }

    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    async fn connection(&self) -> QueueResult<ConnectionManager> {
        self.pool.get().await.map_err(|err| {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
            err
        })
    }

    /// Account a command-level backend failure and drop the cached
    /// connection so the next call reconnects. The driver stays usable.
    async fn note_unavailable(&self, err: QueueError) -> QueueError {
        if matches!(err, QueueError::DriverUnavailable(_)) {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
            self.pool.invalidate().await;
        }
        err
    }

    /// Move delayed entries whose ready time has passed onto the ready list.
    async fn migrate_due_delayed(&self, conn: &mut ConnectionManager) -> QueueResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::DriverUnavailable(e.to_string()))?;

        for value in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&value)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::DriverUnavailable(e.to_string()))?;
            // Another consumer may have migrated it first
            if removed > 0 {
                redis::cmd("LPUSH")
                    .arg(&self.queue_key)
                    .arg(&value)
                    .query_async::<_, i64>(conn)
                    .await
                    .map_err(|e| QueueError::DriverUnavailable(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn push_record(
        &self,
        conn: &mut ConnectionManager,
        record: &JobRecord,
    ) -> QueueResult<()> {
        let value = serde_json::to_string(record)?;
        match record.scheduled_for {
            Some(at) => {
                redis::cmd("ZADD")
                    .arg(&self.delayed_key)
                    .arg(at.timestamp_millis())
                    .arg(&value)
                    .query_async::<_, i64>(conn)
                    .await
            }
            None => {
                redis::cmd("LPUSH")
                    .arg(&self.queue_key)
                    .arg(&value)
                    .query_async::<_, i64>(conn)
                    .await
            }
        }
        .map_err(|e| QueueError::DriverUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueDriver for RedisDriver {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn enqueue(&self, job: Arc<dyn Job>, options: EnqueueOptions) -> QueueResult<String> {
        let ctx = self.core.prepare_context(job, &options);
        let record = JobRecord::from_context(&ctx);

        let mut conn = self.connection().await?;
        match self.push_record(&mut conn, &record).await {
            Ok(()) => {
                self.core.record_enqueued(&ctx);
                Ok(ctx.id)
            }
            Err(err) => Err(self.note_unavailable(err).await),
        }
    }

    async fn process_one(&self) -> QueueResult<bool> {
        let mut conn = self.connection().await?;

        if let Err(err) = self.migrate_due_delayed(&mut conn).await {
            return Err(self.note_unavailable(err).await);
        }

        let value: Option<String> = match redis::cmd("RPOP")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                let err = QueueError::DriverUnavailable(e.to_string());
                return Err(self.note_unavailable(err).await);
            }
        };

        let value = match value {
            Some(value) => value,
            None => return Ok(false),
        };

        let record: JobRecord = match serde_json::from_str(&value) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %self.queue_key, error = %err, "dropping undecodable queue entry");
                let _: Result<i64, _> = redis::cmd("LPUSH")
                    .arg(&self.failed_key)
                    .arg(&value)
                    .query_async(&mut conn)
                    .await;
                return Ok(true);
            }
        };

        let job = match self
            .core
            .registry()
            .create(&record.job_type, &record.payload)
        {
            Ok(job) => job,
            Err(err) => {
                warn!(
                    key = %self.queue_key,
                    job_type = %record.job_type,
                    job_id = %record.id,
                    error = %err,
                    "unknown job type, moving entry to the failed list"
                );
                let _: Result<i64, _> = redis::cmd("LPUSH")
                    .arg(&self.failed_key)
                    .arg(&value)
                    .query_async(&mut conn)
                    .await;
                return Ok(true);
            }
        };

        let mut ctx = record.into_context(job);
        match self.core.execute(&mut ctx).await {
            ExecutionOutcome::Completed => {}
            ExecutionOutcome::Retried(_) => {
                let record = JobRecord::from_context(&ctx);
                if let Err(err) = self.push_record(&mut conn, &record).await {
                    warn!(job_id = %ctx.id, error = %err, "failed to reschedule retried job");
                }
            }
            ExecutionOutcome::DeadLettered => {
                let record = JobRecord::from_context(&ctx);
                if let Ok(value) = serde_json::to_string(&record) {
                    let _: Result<i64, _> = redis::cmd("LPUSH")
                        .arg(&self.failed_key)
                        .arg(value)
                        .query_async(&mut conn)
                        .await;
                }
            }
        }
        Ok(true)
    }

    async fn queue_depth(&self) -> usize {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(_) => return 0,
        };
        let ready: i64 = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        let delayed: i64 = redis::cmd("ZCARD")
            .arg(&self.delayed_key)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        (ready + delayed).max(0) as usize
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        if let Err(e) = redis::cmd("DEL")
            .arg(&self.queue_key)
            .arg(&self.delayed_key)
            .query_async::<_, i64>(&mut conn)
            .await
        {
            let err = QueueError::DriverUnavailable(e.to_string());
            return Err(self.note_unavailable(err).await);
        }
        Ok(())
    }

    async fn dispose(&self) -> QueueResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn stats(&self) -> Map<String, Value> {
        let depth = self.queue_depth().await;
        let mut stats = self.core.base_stats(depth);
        stats.insert(
            "connection_failures".into(),
            Value::from(self.connection_failures.load(Ordering::Relaxed)),
        );
        stats.insert("url".into(), Value::String(self.pool.url().to_string()));
        stats
    }
}
