use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared handle used by the server, the pool and each document.
pub type MetricsHandle = Arc<Mutex<EngineMetrics>>;

#[derive(Debug, Default, Clone)]
pub struct EngineMetrics {
    refreshes: u64,
    dispatch_skipped: u64,
    controls_visited: u64,
    bindings_evaluated: u64,
    bindings_optimized: u64,
    events_dispatched: u64,
    pool_hits: u64,
    pool_misses: u64,
    pool_discards: u64,
    store_evictions: u64,
    shared_hits: u64,
    shared_misses: u64,
    shared_expired: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> MetricsHandle {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record_refresh(&mut self, visited: usize, evaluated: usize, optimized: usize) {
        self.refreshes = self.refreshes.saturating_add(1);
        self.controls_visited = self.controls_visited.saturating_add(visited as u64);
        self.bindings_evaluated = self.bindings_evaluated.saturating_add(evaluated as u64);
        self.bindings_optimized = self.bindings_optimized.saturating_add(optimized as u64);
    }

    pub fn record_dispatch(&mut self, events: usize) {
        self.events_dispatched = self.events_dispatched.saturating_add(events as u64);
    }

    pub fn record_dispatch_skipped(&mut self) {
        self.dispatch_skipped = self.dispatch_skipped.saturating_add(1);
    }

    pub fn record_pool_hit(&mut self) {
        self.pool_hits = self.pool_hits.saturating_add(1);
    }

    pub fn record_pool_miss(&mut self) {
        self.pool_misses = self.pool_misses.saturating_add(1);
    }

    pub fn record_pool_discard(&mut self) {
        self.pool_discards = self.pool_discards.saturating_add(1);
    }

    pub fn record_store_evictions(&mut self, count: usize) {
        if count > 0 {
            self.store_evictions = self.store_evictions.saturating_add(count as u64);
        }
    }

    pub fn record_shared_lookup(&mut self, hit: bool, expired: bool) {
        if hit {
            self.shared_hits = self.shared_hits.saturating_add(1);
        } else {
            self.shared_misses = self.shared_misses.saturating_add(1);
        }
        if expired {
            self.shared_expired = self.shared_expired.saturating_add(1);
        }
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            refreshes: self.refreshes,
            dispatch_skipped: self.dispatch_skipped,
            controls_visited: self.controls_visited,
            bindings_evaluated: self.bindings_evaluated,
            bindings_optimized: self.bindings_optimized,
            events_dispatched: self.events_dispatched,
            pool_hits: self.pool_hits,
            pool_misses: self.pool_misses,
            pool_discards: self.pool_discards,
            store_evictions: self.store_evictions,
            shared_hits: self.shared_hits,
            shared_misses: self.shared_misses,
            shared_expired: self.shared_expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub refreshes: u64,
    pub dispatch_skipped: u64,
    pub controls_visited: u64,
    pub bindings_evaluated: u64,
    pub bindings_optimized: u64,
    pub events_dispatched: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub pool_discards: u64,
    pub store_evictions: u64,
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub shared_expired: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "engine_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("refreshes".to_string(), json!(self.refreshes));
        map.insert("dispatch_skipped".to_string(), json!(self.dispatch_skipped));
        map.insert("controls_visited".to_string(), json!(self.controls_visited));
        map.insert("bindings_evaluated".to_string(), json!(self.bindings_evaluated));
        map.insert("bindings_optimized".to_string(), json!(self.bindings_optimized));
        map.insert("events_dispatched".to_string(), json!(self.events_dispatched));
        map.insert("pool_hits".to_string(), json!(self.pool_hits));
        map.insert("pool_misses".to_string(), json!(self.pool_misses));
        map.insert("pool_discards".to_string(), json!(self.pool_discards));
        map.insert("store_evictions".to_string(), json!(self.store_evictions));
        map.insert("shared_hits".to_string(), json!(self.shared_hits));
        map.insert("shared_misses".to_string(), json!(self.shared_misses));
        map.insert("shared_expired".to_string(), json!(self.shared_expired));
        map
    }
}

/// Apply `f` to the metrics behind an optional handle, ignoring poisoning.
pub fn with_metrics(handle: Option<&MetricsHandle>, f: impl FnOnce(&mut EngineMetrics)) {
    if let Some(metrics) = handle {
        if let Ok(mut guard) = metrics.lock() {
            f(&mut guard);
        }
    }
}
