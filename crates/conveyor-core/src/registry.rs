//! Job type registry and serialization envelope
//!
//! The registry maps job type strings (e.g., "send_email") to factory
//! functions that reconstruct typed jobs from their serialized payloads.
//! Drivers use it to persist jobs and to rebuild them on load.

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Envelope key carrying the registered type name.
pub const TYPE_KEY: &str = "type";

/// Envelope key carrying the serialization instant.
pub const CREATED_AT_KEY: &str = "created_at";

/// Factory reconstructing a job from its payload map.
pub type JobFactory =
    Arc<dyn Fn(&Map<String, Value>) -> QueueResult<Arc<dyn Job>> + Send + Sync>;

/// Registry that maps job type names to factories.
///
/// Registration happens at startup before workers run; reads afterwards take
/// the lock uncontended. Tests build isolated instances rather than sharing
/// the process-wide default.
#[derive(Default)]
pub struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory under a type name.
    ///
    /// Registering an already-present name fails with `AlreadyRegistered`.
    pub fn register<F>(&self, type_name: impl Into<String>, factory: F) -> QueueResult<()>
    where
        F: Fn(&Map<String, Value>) -> QueueResult<Arc<dyn Job>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if type_name.is_empty() {
            return Err(QueueError::Validation("job type name is empty".into()));
        }

        let mut factories = self.factories.write().expect("registry lock poisoned");
        if factories.contains_key(&type_name) {
            return Err(QueueError::AlreadyRegistered(type_name));
        }
        factories.insert(type_name, Arc::new(factory));
        Ok(())
    }

    /// Reconstruct a job from its type name and payload.
    pub fn create(&self, type_name: &str, payload: &Map<String, Value>) -> QueueResult<Arc<dyn Job>> {
        let factory = {
            let factories = self.factories.read().expect("registry lock poisoned");
            factories
                .get(type_name)
                .cloned()
                .ok_or_else(|| QueueError::UnknownType(type_name.to_string()))?
        };

        factory(payload).map_err(|err| QueueError::DeserializationFailure {
            job_type: type_name.to_string(),
            reason: err.to_string(),
        })
    }

    /// Check if a type name is registered.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .contains_key(type_name)
    }

    /// All registered type names.
    pub fn registered_types(&self) -> Vec<String> {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Remove all registrations. For tests.
    pub fn clear(&self) {
        self.factories
            .write()
            .expect("registry lock poisoned")
            .clear();
    }

    /// Serialize a job into its self-describing envelope:
    /// `{"type": .., "created_at": .., ...job.to_map()}`.
    pub fn serialize(&self, job: &dyn Job) -> Map<String, Value> {
        let mut envelope = Map::new();
        envelope.insert(TYPE_KEY.into(), Value::String(job.job_type().to_string()));
        envelope.insert(
            CREATED_AT_KEY.into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        for (key, value) in job.to_map() {
            envelope.insert(key, value);
        }
        envelope
    }

    /// Reconstruct a job from an envelope produced by [`serialize`](Self::serialize).
    ///
    /// The envelope keys (`type`, `created_at`) are stripped before the
    /// factory sees the payload.
    pub fn deserialize(&self, envelope: &Map<String, Value>) -> QueueResult<Arc<dyn Job>> {
        let type_name = envelope
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .ok_or(QueueError::MissingType)?;

        let mut payload = envelope.clone();
        payload.remove(TYPE_KEY);
        payload.remove(CREATED_AT_KEY);

        self.create(type_name, &payload)
    }
}

/// Process-wide convenience registry for simple setups.
///
/// Drivers take a registry instance on construction, so tests and embedders
/// can ignore this and use their own.
pub static DEFAULT_REGISTRY: Lazy<Arc<JobRegistry>> = Lazy::new(|| Arc::new(JobRegistry::new()));
