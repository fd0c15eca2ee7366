//! Redis connection management for the network key-value driver

use crate::error::{QueueError, QueueResult};
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Reconnecting handle around a Redis connection manager.
///
/// Connections are established lazily. Every acquisition retries up to
/// `max_retries` times; once the budget is exhausted the operation fails
/// with `DriverUnavailable`, but the pool stays usable and the next call
/// starts a fresh attempt.
pub struct RedisConnectionPool {
    client: Client,
    manager: RwLock<Option<ConnectionManager>>,
    max_retries: u32,
    retry_delay: Duration,
    url: String,
}

impl RedisConnectionPool {
    /// Validate the URL and build an unconnected pool.
    pub fn new(url: &str, max_retries: u32, retry_delay: Duration) -> QueueResult<Self> {
        if url.is_empty() {
            return Err(QueueError::Validation("redis url is empty".into()));
        }
        let client = Client::open(url)
            .map_err(|e| QueueError::Validation(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
            max_retries: max_retries.max(1),
            retry_delay,
            url: url.to_string(),
        })
    }

    /// Get a connection, reconnecting if needed.
    pub async fn get(&self) -> QueueResult<ConnectionManager> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(manager.clone());
        }
        self.reconnect().await
    }

    /// Drop the cached connection so the next `get` reconnects.
    /// Called after a command-level connection failure.
    pub async fn invalidate(&self) {
        *self.manager.write().await = None;
    }

    async fn reconnect(&self) -> QueueResult<ConnectionManager> {
        let mut slot = self.manager.write().await;
        // Another caller may have reconnected while we waited for the lock
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(url = %self.url, attempt, "connecting to redis");
            match ConnectionManager::new(self.client.clone()).await {
                Ok(mut manager) => {
                    let pong: Result<String, _> =
                        redis::cmd("PING").query_async(&mut manager).await;
                    match pong {
                        Ok(reply) if reply == "PONG" => {
                            info!(url = %self.url, attempt, "redis connected");
                            *slot = Some(manager.clone());
                            return Ok(manager);
                        }
                        Ok(reply) => {
                            warn!(url = %self.url, %reply, "unexpected PING reply");
                        }
                        Err(err) => {
                            warn!(url = %self.url, error = %err, "redis PING failed");
                        }
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, attempt, error = %err, "redis connection failed");
                }
            }

            if attempt >= self.max_retries {
                return Err(QueueError::DriverUnavailable(format!(
                    "redis at {} unreachable after {attempt} attempts",
                    self.url
                )));
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    pub async fn close(&self) {
        *self.manager.write().await = None;
        debug!(url = %self.url, "redis pool closed");
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
