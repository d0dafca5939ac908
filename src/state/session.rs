use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{MetricsHandle, with_metrics};

const TARGET: &str = "formtree::session";

/// Default byte bound of the session store.
pub const DEFAULT_STORE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug)]
struct StoredEntry {
    value: String,
    size: usize,
    initial: bool,
}

#[derive(Debug)]
struct StoreInner {
    entries: LruCache<String, StoredEntry>,
    current_bytes: usize,
}

/// Byte-bounded LRU store for serialized state, keyed by session token id.
///
/// Static and dynamic halves are separate entries so an unchanging static
/// state is stored once per form session.
pub struct SessionStateStore {
    inner: Mutex<StoreInner>,
    max_bytes: usize,
    logger: Option<Logger>,
    metrics: Option<MetricsHandle>,
}

impl SessionStateStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: LruCache::unbounded(),
                current_bytes: 0,
            }),
            max_bytes,
            logger: None,
            metrics: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<MetricsHandle>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Insert `value` as the most recent entry, evicting least recently used
    /// entries until it fits. Returns the number of evictions.
    ///
    /// An entry larger than the whole bound is still stored once the store is
    /// empty.
    pub fn add(&self, key: &str, value: &str, initial: bool) -> usize {
        let size = key.len() + value.len();
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        if let Some(previous) = inner.entries.pop(key) {
            inner.current_bytes -= previous.size;
        }
        let mut evicted = 0;
        while inner.current_bytes != 0 && inner.current_bytes + size > self.max_bytes {
            let Some((_, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.current_bytes -= entry.size;
            evicted += 1;
        }
        inner.entries.put(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                size,
                initial,
            },
        );
        inner.current_bytes += size;
        let current = inner.current_bytes;
        drop(inner);

        if evicted > 0 {
            with_metrics(self.metrics.as_ref(), |m| m.record_store_evictions(evicted));
            emit(
                self.logger.as_ref(),
                LogLevel::Debug,
                TARGET,
                "evicted session entries",
                [json_kv("evicted", evicted), json_kv("bytes", current)],
            );
        }
        evicted
    }

    /// Look up `key`, making it the most recently used entry.
    pub fn find(&self, key: &str) -> Option<String> {
        let mut inner = self.lock()?;
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        let Some(mut inner) = self.lock() else {
            return false;
        };
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.current_bytes -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Store both halves of a document's state. An existing static entry is
    /// kept; `static_state` is only needed when it may be missing. The
    /// previous dynamic entry is dropped unless it is the initial one, which
    /// clients tend to request again (for example after navigating back).
    pub fn add_state(
        &self,
        static_id: &str,
        previous_dynamic_id: Option<&str>,
        dynamic_id: &str,
        static_state: Option<&str>,
        dynamic_state: &str,
        initial: bool,
    ) {
        let present = self.find(static_id).is_some();
        if let (false, Some(static_state)) = (present, static_state) {
            self.add(static_id, static_state, false);
        }
        if let Some(previous) = previous_dynamic_id.filter(|p| *p != dynamic_id) {
            let keep = self
                .lock()
                .and_then(|inner| inner.entries.peek(previous).map(|e| e.initial))
                .unwrap_or(false);
            if !keep {
                self.remove(previous);
            }
        }
        self.add(dynamic_id, dynamic_state, initial);
    }

    /// Both halves of a document's state, or nothing if either expired.
    pub fn find_state(&self, static_id: &str, dynamic_id: &str) -> Option<(String, String)> {
        let static_state = self.find(static_id);
        let dynamic_state = self.find(dynamic_id);
        match (static_state, dynamic_state) {
            (Some(s), Some(d)) => Some((s, d)),
            (s, d) => {
                emit(
                    self.logger.as_ref(),
                    LogLevel::Info,
                    TARGET,
                    "session state missing",
                    [
                        json_str("static_id", static_id),
                        json_str("dynamic_id", dynamic_id),
                        json_kv("static_found", s.is_some()),
                        json_kv("dynamic_found", d.is_some()),
                    ],
                );
                None
            }
        }
    }

    pub fn current_bytes(&self) -> usize {
        self.lock().map_or(0, |inner| inner.current_bytes)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |inner| inner.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().is_some_and(|inner| inner.entries.contains(key))
    }

    fn lock(&self) -> Option<MutexGuard<'_, StoreInner>> {
        self.inner.lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(len: usize) -> String {
        "x".repeat(len)
    }

    #[test]
    fn eviction_takes_least_recently_used_first() {
        let store = SessionStateStore::new(100);
        store.add("a", &value(39), false);
        store.add("b", &value(39), false);
        assert_eq!(store.current_bytes(), 80);

        assert!(store.find("a").is_some());
        let evicted = store.add("c", &value(39), false);
        assert_eq!(evicted, 1);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
        assert_eq!(store.current_bytes(), 80);
    }

    #[test]
    fn oversized_entry_replaces_everything() {
        let store = SessionStateStore::new(10);
        store.add("a", "1234", false);
        let evicted = store.add("b", &value(50), false);
        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_bytes(), 51);
    }

    #[test]
    fn re_adding_a_key_replaces_its_accounting() {
        let store = SessionStateStore::new(100);
        store.add("a", "1234", false);
        store.add("a", "12", false);
        assert_eq!(store.current_bytes(), 3);
        assert!(store.remove("a"));
        assert_eq!(store.current_bytes(), 0);
        assert!(!store.remove("a"));
    }

    #[test]
    fn add_state_keeps_the_initial_dynamic_entry() {
        let store = SessionStateStore::new(1_000);
        store.add_state("s", None, "d1", Some("static"), "dyn1", true);
        store.add_state("s", Some("d1"), "d2", None, "dyn2", false);
        store.add_state("s", Some("d2"), "d3", None, "dyn3", false);
        assert!(store.contains("d1"));
        assert!(!store.contains("d2"));
        assert_eq!(
            store.find_state("s", "d3"),
            Some(("static".to_string(), "dyn3".to_string()))
        );
        assert_eq!(store.find_state("s", "d2"), None);
    }
}
