//! Job trait and supporting types

use crate::error::QueueResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Unit of background work.
///
/// Callers implement this for each job type and register a factory for it
/// with the [`JobRegistry`](crate::registry::JobRegistry) so drivers can
/// reconstruct jobs from their serialized form.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// The type name this job was registered under.
    fn job_type(&self) -> &str;

    /// Execute the job.
    async fn handle(&self) -> QueueResult<()>;

    /// Serialize the job's payload to a flat map.
    fn to_map(&self) -> Map<String, Value>;

    /// Human-readable name for logs and stats.
    fn display_name(&self) -> String {
        self.job_type().to_string()
    }

    /// Default priority when enqueue options don't specify one.
    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    /// Free-form metadata merged into the job context at enqueue time.
    fn metadata(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Job priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Low priority jobs (processed last)
    Low = 0,

    /// Normal priority jobs (default)
    Normal = 1,

    /// High priority jobs
    High = 2,

    /// Critical jobs (processed first)
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Critical => write!(f, "critical"),
        }
    }
}

impl JobPriority {
    /// Create from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            "critical" => Some(JobPriority::Critical),
            _ => None,
        }
    }

    /// All priorities, highest first.
    pub fn descending() -> [JobPriority; 4] {
        [
            JobPriority::Critical,
            JobPriority::High,
            JobPriority::Normal,
            JobPriority::Low,
        ]
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Waiting to be picked up
    Pending,

    /// Currently executing (or awaiting a retry attempt)
    Processing,

    /// Finished successfully
    Completed,

    /// Failed, retry budget not yet exhausted
    Failed,

    /// Permanently failed and moved to the dead-letter queue
    DeadLettered,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::DeadLettered => write!(f, "deadLettered"),
        }
    }
}

impl JobStatus {
    /// Check if status is terminal (won't change)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered)
    }
}

/// Options supplied at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay before the job becomes ready (default: none)
    pub delay: Option<Duration>,

    /// Priority override; falls back to the job's own priority
    pub priority: Option<JobPriority>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(JobPriority::parse("critical"), Some(JobPriority::Critical));
        assert_eq!(JobPriority::parse("HIGH"), Some(JobPriority::High));
        assert_eq!(JobPriority::parse("bogus"), None);
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&JobStatus::DeadLettered).unwrap();
        assert_eq!(json, "\"deadLettered\"");
        let json = serde_json::to_string(&JobStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn test_enqueue_options_builder() {
        let options = EnqueueOptions::new()
            .with_delay(Duration::from_secs(5))
            .with_priority(JobPriority::High);
        assert_eq!(options.delay, Some(Duration::from_secs(5)));
        assert_eq!(options.priority, Some(JobPriority::High));
    }
}
