//! Queue runtime configuration
//!
//! The core consumes configuration as opaque key-value data: callers
//! deserialize whatever format they use (TOML, YAML, JSON) into these
//! structs, and driver-specific keys stay in an untyped `options` map.

use crate::error::{QueueError, QueueResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Name of the driver used when none is requested explicitly
    #[serde(default = "default_driver")]
    pub default_driver: String,

    /// Driver-specific configuration, keyed by driver name
    #[serde(default)]
    pub drivers: HashMap<String, DriverConfig>,

    /// Worker configuration
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Retry policy applied when a driver doesn't override it
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_driver: default_driver(),
            drivers: HashMap::new(),
            workers: WorkerSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Development configuration (single worker, fast polling)
    pub fn development() -> Self {
        Self {
            workers: WorkerSettings {
                delay_secs: 1,
                ..Default::default()
            },
            ..Self::default()
        }
    }

    /// Production configuration (bigger retry budget, patient shutdown)
    pub fn production() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 5,
                ..Default::default()
            },
            workers: WorkerSettings {
                graceful_shutdown_secs: 60,
                ..Default::default()
            },
            ..Self::default()
        }
    }

    /// Configuration for a named driver, or an empty default.
    pub fn driver(&self, name: &str) -> DriverConfig {
        self.drivers.get(name).cloned().unwrap_or_default()
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> QueueResult<()> {
        if self.default_driver.is_empty() {
            return Err(QueueError::Validation("driver name is empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(QueueError::Validation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        for (name, driver) in &self.drivers {
            if name.is_empty() {
                return Err(QueueError::Validation("driver name is empty".into()));
            }
            driver.validate()?;
        }
        self.workers.validate()
    }
}

/// Per-driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver-specific keys (storage_path, url, queue, max_retries, ...)
    #[serde(default)]
    pub options: Map<String, Value>,

    /// Retry override for jobs on this driver
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Push exhausted jobs into the dead-letter queue
    #[serde(default = "default_true")]
    pub use_dead_letter: bool,

    /// Attach the logging middleware
    #[serde(default = "default_true")]
    pub logging: bool,

    /// Attach the timing middleware
    #[serde(default = "default_true")]
    pub timing: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            options: Map::new(),
            retry: None,
            use_dead_letter: true,
            logging: true,
            timing: true,
        }
    }
}

impl DriverConfig {
    /// String option lookup.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Integer option lookup.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    fn validate(&self) -> QueueResult<()> {
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(QueueError::Validation(
                    "retry.max_attempts must be at least 1".into(),
                ));
            }
        }
        for key in ["delay_secs", "ttl_secs"] {
            if let Some(value) = self.options.get(key).and_then(Value::as_i64) {
                if value < 0 {
                    return Err(QueueError::Validation(format!("{key} must not be negative")));
                }
            }
        }
        Ok(())
    }
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Stop after this many processed jobs (None = unbounded)
    #[serde(default)]
    pub max_jobs: Option<u64>,

    /// Delay between consecutive dequeue attempts
    #[serde(default = "default_worker_delay")]
    pub delay_secs: u64,

    /// Wall-clock bound on a worker's total run (None = unbounded)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// How long `stop` waits for in-flight work
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_jobs: None,
            delay_secs: default_worker_delay(),
            timeout_secs: None,
            graceful_shutdown_secs: default_graceful_shutdown(),
        }
    }
}

impl WorkerSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    fn validate(&self) -> QueueResult<()> {
        if self.max_jobs == Some(0) {
            return Err(QueueError::Validation(
                "workers.max_jobs must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}

fn default_driver() -> String {
    "sync".to_string()
}

fn default_true() -> bool {
    true
}

fn default_worker_delay() -> u64 {
    1
}

fn default_graceful_shutdown() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.default_driver, "sync");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.workers.delay_secs, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_production_config() {
        let config = QueueConfig::production();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.workers.graceful_shutdown_secs, 60);
    }

    #[test]
    fn test_driver_lookup_falls_back() {
        let config = QueueConfig::default();
        let driver = config.driver("file");
        assert!(driver.use_dead_letter);
        assert!(driver.options.is_empty());
    }

    #[test]
    fn test_from_opaque_json() {
        let raw = json!({
            "default_driver": "file",
            "drivers": {
                "file": {
                    "options": {"storage_path": "/var/lib/queue"},
                    "use_dead_letter": false
                }
            }
        });
        let config: QueueConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.default_driver, "file");
        let file = config.driver("file");
        assert_eq!(file.option_str("storage_path"), Some("/var/lib/queue"));
        assert!(!file.use_dead_letter);
    }

    #[test]
    fn test_validation_rejects_empty_driver() {
        let config = QueueConfig {
            default_driver: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_negative_option() {
        let mut driver = DriverConfig::default();
        driver.options.insert("ttl_secs".into(), json!(-5));
        let mut config = QueueConfig::default();
        config.drivers.insert("memory".into(), driver);
        assert!(matches!(config.validate(), Err(QueueError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = QueueConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(QueueError::Validation(_))));
    }
}
