//! Engine configuration.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Tunables for an [`Engine`](crate::Engine).
///
/// Every field has a default, so a JSON document only needs the fields it
/// overrides:
///
/// ```rust
/// use skygraph_core::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{ "worker_threads": 4 }"#).unwrap();
/// assert_eq!(config.worker_threads, 4);
/// assert_eq!(config.thread_name, "skygraph-worker");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the fixed worker pool that runs node functions.
    pub worker_threads: usize,

    /// Name given to worker threads.
    pub thread_name: String,
}

impl EngineConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Override the worker count. Zero is bumped to one.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub(crate) fn effective_worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            thread_name: "skygraph-worker".to_string(),
        }
    }
}
