use serde::{Deserialize, Serialize};

use crate::logging::Logger;
use crate::metrics::{EngineMetrics, MetricsHandle};
use crate::state::{
    DEFAULT_POOL_CAPACITY, DEFAULT_SHARED_CAPACITY, DEFAULT_STORE_BYTES, new_session_id,
};

/// Where serialized state lives between exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateHandling {
    /// Blobs travel with each request and response.
    #[default]
    Inline,
    /// Blobs stay in the session store; clients hold `session:` ids.
    Session,
}

/// Tunables for a [`FormServer`](super::FormServer).
#[derive(Clone)]
pub struct EngineConfig {
    /// Mode used for new documents. Requests keep the mode their tokens use.
    pub state_handling: StateHandling,
    /// Byte bound of the session store.
    pub session_store_bytes: usize,
    /// Number of token keys the document pool keeps.
    pub pool_capacity: usize,
    /// Number of shared read-only instances kept.
    pub shared_instance_capacity: usize,
    /// Key material for the state blob check. Defaults to a random value, so
    /// servers that must accept each other's blobs need to set the same one.
    pub state_secret: String,
    /// Keep documents alive between requests. When off, every request
    /// rebuilds its document from serialized state.
    pub cache_documents: bool,
    /// Optional structured logger.
    pub logger: Option<Logger>,
    /// Metrics accumulator shared with pools, caches and documents.
    pub metrics: Option<MetricsHandle>,
    /// Target field used when emitting metrics snapshots.
    pub metrics_target: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_handling: StateHandling::Inline,
            session_store_bytes: DEFAULT_STORE_BYTES,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            shared_instance_capacity: DEFAULT_SHARED_CAPACITY,
            state_secret: format!("{}{}", new_session_id(), new_session_id()),
            cache_documents: true,
            logger: None,
            metrics: None,
            metrics_target: "formtree::metrics".to_string(),
        }
    }
}

impl EngineConfig {
    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(EngineMetrics::handle());
        }
    }

    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    /// Access the shared metrics handle if metrics are enabled.
    pub fn metrics_handle(&self) -> Option<MetricsHandle> {
        self.metrics.clone()
    }
}
