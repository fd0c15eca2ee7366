//! Queue metrics: counters, breakdowns, rolling statistics, exports
//!
//! Safe for concurrent increment/read: counters are atomics, breakdowns live
//! in concurrent maps, and the bounded sample/history windows sit behind
//! short mutex sections. All record operations are synchronous so drivers
//! and workers can call them without awaiting.

use crate::job::JobPriority;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_MAX_SAMPLES: usize = 10_000;
const DEFAULT_MAX_HISTORY: usize = 1_000;

/// Point-in-time queue depth observation.
#[derive(Debug, Clone, Copy)]
struct DepthSnapshot {
    depth: u64,
}

/// Point-in-time worker utilization observation.
#[derive(Debug, Clone, Copy)]
struct UtilizationSnapshot {
    ratio: f64,
}

/// Rolling metrics for a queue driver and its workers.
pub struct QueueMetrics {
    started_at: Mutex<Instant>,

    total_queued: AtomicU64,
    total_started: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    total_retried: AtomicU64,
    total_timed_out: AtomicU64,
    currently_processing: AtomicU64,

    queued_by_type: DashMap<String, u64>,
    queued_by_priority: DashMap<JobPriority, u64>,
    completed_by_type: DashMap<String, u64>,
    completed_by_priority: DashMap<JobPriority, u64>,
    failed_by_type: DashMap<String, u64>,
    failed_by_priority: DashMap<JobPriority, u64>,
    retried_by_type: DashMap<String, u64>,
    timed_out_by_type: DashMap<String, u64>,
    duration_by_type: DashMap<String, (u64, f64)>,

    samples: Mutex<VecDeque<f64>>,
    depth_history: Mutex<VecDeque<DepthSnapshot>>,
    utilization_history: Mutex<VecDeque<UtilizationSnapshot>>,

    max_samples: usize,
    max_history: usize,
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_MAX_SAMPLES, DEFAULT_MAX_HISTORY)
    }

    /// Bounded sample and history windows (both must be non-zero).
    pub fn with_bounds(max_samples: usize, max_history: usize) -> Self {
        Self {
            started_at: Mutex::new(Instant::now()),
            total_queued: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_retried: AtomicU64::new(0),
            total_timed_out: AtomicU64::new(0),
            currently_processing: AtomicU64::new(0),
            queued_by_type: DashMap::new(),
            queued_by_priority: DashMap::new(),
            completed_by_type: DashMap::new(),
            completed_by_priority: DashMap::new(),
            failed_by_type: DashMap::new(),
            failed_by_priority: DashMap::new(),
            retried_by_type: DashMap::new(),
            timed_out_by_type: DashMap::new(),
            duration_by_type: DashMap::new(),
            samples: Mutex::new(VecDeque::new()),
            depth_history: Mutex::new(VecDeque::new()),
            utilization_history: Mutex::new(VecDeque::new()),
            max_samples: max_samples.max(1),
            max_history: max_history.max(1),
        }
    }

    // ---- record operations ----

    pub fn job_queued(&self, job_type: &str, priority: JobPriority) {
        self.total_queued.fetch_add(1, Ordering::Relaxed);
        *self.queued_by_type.entry(job_type.to_string()).or_insert(0) += 1;
        *self.queued_by_priority.entry(priority).or_insert(0) += 1;
    }

    /// Record the first execution attempt of a job.
    ///
    /// `currently_processing` stays raised across retries of the same job and
    /// drops only at a terminal outcome, so
    /// `started = completed + failed + timed_out + processing` holds at every
    /// point in time.
    pub fn job_started(&self) {
        self.total_started.fetch_add(1, Ordering::Relaxed);
        self.currently_processing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self, job_type: &str, duration: Duration, priority: JobPriority) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        self.decrement_processing();
        *self
            .completed_by_type
            .entry(job_type.to_string())
            .or_insert(0) += 1;
        *self.completed_by_priority.entry(priority).or_insert(0) += 1;

        let millis = duration.as_secs_f64() * 1000.0;
        {
            let mut entry = self
                .duration_by_type
                .entry(job_type.to_string())
                .or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += millis;
        }

        let mut samples = self.samples.lock().expect("metrics lock poisoned");
        if samples.len() == self.max_samples {
            samples.pop_front();
        }
        samples.push_back(millis);
    }

    /// Record a terminal, non-timeout failure.
    pub fn job_failed(&self, job_type: &str, priority: JobPriority) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.decrement_processing();
        *self.failed_by_type.entry(job_type.to_string()).or_insert(0) += 1;
        *self.failed_by_priority.entry(priority).or_insert(0) += 1;
    }

    /// Record a retry being scheduled. Does not touch `currently_processing`.
    pub fn job_retried(&self, job_type: &str) {
        self.total_retried.fetch_add(1, Ordering::Relaxed);
        *self.retried_by_type.entry(job_type.to_string()).or_insert(0) += 1;
    }

    /// Record a terminal timeout. Counted separately from other failures.
    pub fn job_timed_out(&self, job_type: &str) {
        self.total_timed_out.fetch_add(1, Ordering::Relaxed);
        self.decrement_processing();
        *self
            .timed_out_by_type
            .entry(job_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_queue_depth(&self, depth: u64) {
        let mut history = self.depth_history.lock().expect("metrics lock poisoned");
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(DepthSnapshot { depth });
    }

    pub fn record_worker_utilization(&self, active: usize, total: usize) {
        let ratio = if total == 0 {
            0.0
        } else {
            active as f64 / total as f64
        };
        let mut history = self
            .utilization_history
            .lock()
            .expect("metrics lock poisoned");
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(UtilizationSnapshot { ratio });
    }

    pub fn reset(&self) {
        *self.started_at.lock().expect("metrics lock poisoned") = Instant::now();
        self.total_queued.store(0, Ordering::Relaxed);
        self.total_started.store(0, Ordering::Relaxed);
        self.total_completed.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_retried.store(0, Ordering::Relaxed);
        self.total_timed_out.store(0, Ordering::Relaxed);
        self.currently_processing.store(0, Ordering::Relaxed);
        self.queued_by_type.clear();
        self.queued_by_priority.clear();
        self.completed_by_type.clear();
        self.completed_by_priority.clear();
        self.failed_by_type.clear();
        self.failed_by_priority.clear();
        self.retried_by_type.clear();
        self.timed_out_by_type.clear();
        self.duration_by_type.clear();
        self.samples.lock().expect("metrics lock poisoned").clear();
        self.depth_history
            .lock()
            .expect("metrics lock poisoned")
            .clear();
        self.utilization_history
            .lock()
            .expect("metrics lock poisoned")
            .clear();
    }

    fn decrement_processing(&self) {
        let _ = self
            .currently_processing
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    // ---- counter reads ----

    pub fn total_queued(&self) -> u64 {
        self.total_queued.load(Ordering::Relaxed)
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    pub fn total_completed(&self) -> u64 {
        self.total_completed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    pub fn total_retried(&self) -> u64 {
        self.total_retried.load(Ordering::Relaxed)
    }

    pub fn total_timed_out(&self) -> u64 {
        self.total_timed_out.load(Ordering::Relaxed)
    }

    pub fn currently_processing(&self) -> u64 {
        self.currently_processing.load(Ordering::Relaxed)
    }

    pub fn completed_for_type(&self, job_type: &str) -> u64 {
        self.completed_by_type
            .get(job_type)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn completed_for_priority(&self, priority: JobPriority) -> u64 {
        self.completed_by_priority
            .get(&priority)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn failed_for_priority(&self, priority: JobPriority) -> u64 {
        self.failed_by_priority
            .get(&priority)
            .map(|v| *v)
            .unwrap_or(0)
    }

    // ---- derived statistics ----

    pub fn success_rate(&self) -> f64 {
        let completed = self.total_completed() as f64;
        let finished = completed + self.total_failed() as f64;
        if finished == 0.0 {
            0.0
        } else {
            completed / finished
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let failed = self.total_failed() as f64;
        let finished = failed + self.total_completed() as f64;
        if finished == 0.0 {
            0.0
        } else {
            failed / finished
        }
    }

    pub fn timeout_rate(&self) -> f64 {
        let started = self.total_started() as f64;
        if started == 0.0 {
            0.0
        } else {
            self.total_timed_out() as f64 / started
        }
    }

    pub fn average_processing_time_ms(&self) -> f64 {
        let samples = self.samples.lock().expect("metrics lock poisoned");
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    pub fn average_processing_time_for_type_ms(&self, job_type: &str) -> f64 {
        self.duration_by_type
            .get(job_type)
            .map(|entry| {
                let (count, total) = *entry;
                if count == 0 {
                    0.0
                } else {
                    total / count as f64
                }
            })
            .unwrap_or(0.0)
    }

    pub fn min_processing_time_ms(&self) -> f64 {
        let samples = self.samples.lock().expect("metrics lock poisoned");
        samples.iter().copied().fold(f64::NAN, f64::min).max(0.0)
    }

    pub fn max_processing_time_ms(&self) -> f64 {
        let samples = self.samples.lock().expect("metrics lock poisoned");
        samples.iter().copied().fold(0.0, f64::max)
    }

    pub fn stddev_processing_time_ms(&self) -> f64 {
        let samples = self.samples.lock().expect("metrics lock poisoned");
        let n = samples.len();
        if n == 0 {
            return 0.0;
        }
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        variance.sqrt()
    }

    /// Nearest-rank percentile over the bounded sample window.
    /// An empty window yields zero.
    pub fn percentile_processing_time_ms(&self, percentile: f64) -> f64 {
        let samples = self.samples.lock().expect("metrics lock poisoned");
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    pub fn p50_processing_time_ms(&self) -> f64 {
        self.percentile_processing_time_ms(50.0)
    }

    pub fn p95_processing_time_ms(&self) -> f64 {
        self.percentile_processing_time_ms(95.0)
    }

    pub fn p99_processing_time_ms(&self) -> f64 {
        self.percentile_processing_time_ms(99.0)
    }

    pub fn p999_processing_time_ms(&self) -> f64 {
        self.percentile_processing_time_ms(99.9)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .expect("metrics lock poisoned")
            .elapsed()
    }

    /// Completed jobs per second of uptime.
    pub fn throughput(&self) -> f64 {
        let uptime = self.uptime().as_secs_f64();
        if uptime <= 0.0 {
            0.0
        } else {
            self.total_completed() as f64 / uptime
        }
    }

    pub fn current_queue_depth(&self) -> u64 {
        self.depth_history
            .lock()
            .expect("metrics lock poisoned")
            .back()
            .map(|s| s.depth)
            .unwrap_or(0)
    }

    pub fn average_queue_depth(&self) -> f64 {
        let history = self.depth_history.lock().expect("metrics lock poisoned");
        if history.is_empty() {
            0.0
        } else {
            history.iter().map(|s| s.depth as f64).sum::<f64>() / history.len() as f64
        }
    }

    pub fn peak_queue_depth(&self) -> u64 {
        self.depth_history
            .lock()
            .expect("metrics lock poisoned")
            .iter()
            .map(|s| s.depth)
            .max()
            .unwrap_or(0)
    }

    pub fn current_worker_utilization(&self) -> f64 {
        self.utilization_history
            .lock()
            .expect("metrics lock poisoned")
            .back()
            .map(|s| s.ratio)
            .unwrap_or(0.0)
    }

    pub fn average_worker_utilization(&self) -> f64 {
        let history = self
            .utilization_history
            .lock()
            .expect("metrics lock poisoned");
        if history.is_empty() {
            0.0
        } else {
            history.iter().map(|s| s.ratio).sum::<f64>() / history.len() as f64
        }
    }

    pub fn peak_worker_utilization(&self) -> f64 {
        self.utilization_history
            .lock()
            .expect("metrics lock poisoned")
            .iter()
            .map(|s| s.ratio)
            .fold(0.0, f64::max)
    }

    // ---- exports ----

    /// Flat snapshot with stable keys.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("total_queued".into(), json!(self.total_queued()));
        map.insert("total_started".into(), json!(self.total_started()));
        map.insert("total_completed".into(), json!(self.total_completed()));
        map.insert("total_failed".into(), json!(self.total_failed()));
        map.insert("total_retried".into(), json!(self.total_retried()));
        map.insert("total_timed_out".into(), json!(self.total_timed_out()));
        map.insert(
            "currently_processing".into(),
            json!(self.currently_processing()),
        );
        map.insert("success_rate".into(), json!(self.success_rate()));
        map.insert("failure_rate".into(), json!(self.failure_rate()));
        map.insert("timeout_rate".into(), json!(self.timeout_rate()));
        map.insert(
            "average_processing_time_ms".into(),
            json!(self.average_processing_time_ms()),
        );
        map.insert(
            "min_processing_time_ms".into(),
            json!(self.min_processing_time_ms()),
        );
        map.insert(
            "max_processing_time_ms".into(),
            json!(self.max_processing_time_ms()),
        );
        map.insert(
            "stddev_processing_time_ms".into(),
            json!(self.stddev_processing_time_ms()),
        );
        map.insert(
            "p50_processing_time_ms".into(),
            json!(self.p50_processing_time_ms()),
        );
        map.insert(
            "p95_processing_time_ms".into(),
            json!(self.p95_processing_time_ms()),
        );
        map.insert(
            "p99_processing_time_ms".into(),
            json!(self.p99_processing_time_ms()),
        );
        map.insert(
            "p999_processing_time_ms".into(),
            json!(self.p999_processing_time_ms()),
        );
        map.insert("throughput_per_sec".into(), json!(self.throughput()));
        map.insert("uptime_seconds".into(), json!(self.uptime().as_secs()));
        map.insert("queue_depth".into(), json!(self.current_queue_depth()));
        map.insert(
            "average_queue_depth".into(),
            json!(self.average_queue_depth()),
        );
        map.insert("peak_queue_depth".into(), json!(self.peak_queue_depth()));
        map.insert(
            "worker_utilization".into(),
            json!(self.current_worker_utilization()),
        );
        map.insert(
            "average_worker_utilization".into(),
            json!(self.average_worker_utilization()),
        );
        map.insert(
            "peak_worker_utilization".into(),
            json!(self.peak_worker_utilization()),
        );
        map.insert(
            "queued_by_type".into(),
            Value::Object(dashmap_to_object(&self.queued_by_type)),
        );
        map.insert(
            "queued_by_priority".into(),
            Value::Object(priority_map_to_object(&self.queued_by_priority)),
        );
        map.insert(
            "completed_by_type".into(),
            Value::Object(dashmap_to_object(&self.completed_by_type)),
        );
        map.insert(
            "completed_by_priority".into(),
            Value::Object(priority_map_to_object(&self.completed_by_priority)),
        );
        map.insert(
            "failed_by_type".into(),
            Value::Object(dashmap_to_object(&self.failed_by_type)),
        );
        map.insert(
            "failed_by_priority".into(),
            Value::Object(priority_map_to_object(&self.failed_by_priority)),
        );
        map.insert(
            "retried_by_type".into(),
            Value::Object(dashmap_to_object(&self.retried_by_type)),
        );
        map.insert(
            "timed_out_by_type".into(),
            Value::Object(dashmap_to_object(&self.timed_out_by_type)),
        );
        map
    }

    /// Prometheus text exposition (counters, gauges, processing-time summary).
    pub fn to_prometheus(&self, prefix: &str) -> String {
        let prefix = if prefix.is_empty() { "queue" } else { prefix };
        let mut out = String::new();

        let counters: [(&str, &str, u64); 6] = [
            ("total_queued", "Jobs enqueued", self.total_queued()),
            ("total_started", "Jobs started", self.total_started()),
            ("total_completed", "Jobs completed", self.total_completed()),
            ("total_failed", "Jobs terminally failed", self.total_failed()),
            ("total_retried", "Retries scheduled", self.total_retried()),
            ("total_timed_out", "Jobs timed out", self.total_timed_out()),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
            out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
            out.push_str(&format!("{prefix}_{name} {value}\n"));
        }

        let gauges: [(&str, &str, f64); 4] = [
            (
                "currently_processing",
                "Jobs between first start and terminal outcome",
                self.currently_processing() as f64,
            ),
            (
                "throughput",
                "Completed jobs per second of uptime",
                self.throughput(),
            ),
            (
                "queue_depth",
                "Most recent queue depth observation",
                self.current_queue_depth() as f64,
            ),
            (
                "worker_utilization",
                "Most recent worker utilization ratio",
                self.current_worker_utilization(),
            ),
        ];
        for (name, help, value) in gauges {
            out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
            out.push_str(&format!("# TYPE {prefix}_{name} gauge\n"));
            out.push_str(&format!("{prefix}_{name} {value}\n"));
        }

        out.push_str(&format!(
            "# HELP {prefix}_processing_time_seconds Job processing time\n"
        ));
        out.push_str(&format!(
            "# TYPE {prefix}_processing_time_seconds summary\n"
        ));
        for (quantile, value) in [
            ("0.5", self.p50_processing_time_ms()),
            ("0.95", self.p95_processing_time_ms()),
            ("0.99", self.p99_processing_time_ms()),
        ] {
            out.push_str(&format!(
                "{prefix}_processing_time_seconds{{quantile=\"{quantile}\"}} {}\n",
                value / 1000.0
            ));
        }
        let sample_count = self.samples.lock().expect("metrics lock poisoned").len();
        out.push_str(&format!(
            "{prefix}_processing_time_seconds_sum {}\n",
            self.average_processing_time_ms() * sample_count as f64 / 1000.0
        ));
        out.push_str(&format!(
            "{prefix}_processing_time_seconds_count {sample_count}\n"
        ));

        out
    }
}

fn dashmap_to_object(map: &DashMap<String, u64>) -> Map<String, Value> {
    let mut object = Map::new();
    for entry in map.iter() {
        object.insert(entry.key().clone(), json!(*entry.value()));
    }
    object
}

fn priority_map_to_object(map: &DashMap<JobPriority, u64>) -> Map<String, Value> {
    let mut object = Map::new();
    for entry in map.iter() {
        object.insert(entry.key().to_string(), json!(*entry.value()));
    }
    object
}
