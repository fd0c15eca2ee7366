//! Deduplication middleware

use super::{JobExecutionContext, Middleware, Next};
use crate::error::QueueResult;
use lru::LruCache;
use serde_json::json;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_CAPACITY: usize = 10_000;

/// Skips execution when the context's `job_id` metadata key was seen within
/// the dedupe window. The key cache is LRU-bounded; the stalest entry is
/// dropped on insert once it has expired.
pub struct DeduplicationMiddleware {
    window: Duration,
    seen: Mutex<LruCache<String, Instant>>,
}

impl DeduplicationMiddleware {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            window,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record the key; returns true when it was already seen inside the window.
    async fn check_and_record(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();

        if let Some(at) = seen.get(key) {
            if now.duration_since(*at) < self.window {
                return true;
            }
        }

        // Reclaim the stalest entry if it has expired
        if let Some((_, at)) = seen.peek_lru() {
            if now.duration_since(*at) >= self.window {
                seen.pop_lru();
            }
        }

        seen.put(key.to_string(), now);
        false
    }
}

#[async_trait::async_trait]
impl Middleware for DeduplicationMiddleware {
    fn name(&self) -> &str {
        "deduplication"
    }

    async fn handle(&self, ctx: &mut JobExecutionContext, next: Next<'_>) -> QueueResult<()> {
        let key = ctx
            .metadata
            .get("job_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        if let Some(key) = key {
            if self.check_and_record(&key).await {
                ctx.metadata.insert("deduplicated".into(), json!(true));
                return Ok(());
            }
        }
        next.run(ctx).await
    }
}
