use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;

use crate::error::{EngineError, Result};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{MetricsHandle, with_metrics};
use crate::model::InstanceDocument;

const TARGET: &str = "formtree::shared";

/// Default number of shared instances kept.
pub const DEFAULT_SHARED_CAPACITY: usize = 10;

/// A shared instance is identified by its source and by the options used
/// to process it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedInstanceKey {
    pub uri: String,
    pub handle_xinclude: bool,
}

impl SharedInstanceKey {
    pub fn new(uri: impl Into<String>, handle_xinclude: bool) -> Self {
        Self {
            uri: uri.into(),
            handle_xinclude,
        }
    }
}

/// Loads read-only instances from their source.
pub trait InstanceLoader: Send + Sync {
    fn load(&self, key: &SharedInstanceKey) -> std::result::Result<InstanceDocument, String>;
}

/// Loader serving documents from memory, counting loads.
#[derive(Debug, Default)]
pub struct MapInstanceLoader {
    documents: HashMap<String, InstanceDocument>,
    loads: AtomicUsize,
}

impl MapInstanceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, uri: impl Into<String>, document: InstanceDocument) -> Self {
        self.documents.insert(uri.into(), document);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl InstanceLoader for MapInstanceLoader {
    fn load(&self, key: &SharedInstanceKey) -> std::result::Result<InstanceDocument, String> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.documents
            .get(&key.uri)
            .cloned()
            .ok_or_else(|| format!("no document at `{}`", key.uri))
    }
}

#[derive(Debug)]
struct SharedEntry {
    document: Arc<InstanceDocument>,
    inserted: Instant,
    /// Negative means the entry never expires.
    ttl_ms: i64,
}

impl SharedEntry {
    fn expired(&self, now: Instant) -> bool {
        self.ttl_ms >= 0
            && now.saturating_duration_since(self.inserted).as_millis() > self.ttl_ms as u128
    }
}

/// Read-only instances shared between documents, with lazy expiry.
pub struct SharedInstanceCache {
    entries: Mutex<LruCache<SharedInstanceKey, SharedEntry>>,
    logger: Option<Logger>,
    metrics: Option<MetricsHandle>,
}

impl SharedInstanceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
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

    pub fn add(&self, key: SharedInstanceKey, document: Arc<InstanceDocument>, ttl_ms: i64) {
        self.add_at(key, document, ttl_ms, Instant::now());
    }

    pub fn add_at(
        &self,
        key: SharedInstanceKey,
        document: Arc<InstanceDocument>,
        ttl_ms: i64,
        now: Instant,
    ) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key,
                SharedEntry {
                    document,
                    inserted: now,
                    ttl_ms,
                },
            );
        }
    }

    pub fn find(&self, key: &SharedInstanceKey) -> Option<Arc<InstanceDocument>> {
        self.find_at(key, Instant::now())
    }

    /// Look up `key` as of `now`. An expired entry is removed and reported
    /// as a miss.
    pub fn find_at(&self, key: &SharedInstanceKey, now: Instant) -> Option<Arc<InstanceDocument>> {
        let (found, expired) = {
            let mut entries = self.entries.lock().ok()?;
            match entries.get(key) {
                Some(entry) if entry.expired(now) => {
                    entries.pop(key);
                    (None, true)
                }
                Some(entry) => (Some(entry.document.clone()), false),
                None => (None, false),
            }
        };
        with_metrics(self.metrics.as_ref(), |m| {
            m.record_shared_lookup(found.is_some(), expired)
        });
        if expired {
            emit(
                self.logger.as_ref(),
                LogLevel::Debug,
                TARGET,
                "shared instance expired",
                [json_str("uri", key.uri.clone())],
            );
        }
        found
    }

    /// Cached instance for `key`, loading and caching it on a miss. The load
    /// runs outside the lock; concurrent misses may load twice.
    pub fn find_or_load(
        &self,
        key: &SharedInstanceKey,
        ttl_ms: i64,
        loader: &dyn InstanceLoader,
    ) -> Result<Arc<InstanceDocument>> {
        if let Some(document) = self.find(key) {
            return Ok(document);
        }
        let document = Arc::new(loader.load(key).map_err(|message| EngineError::InstanceLoad {
            uri: key.uri.clone(),
            message,
        })?);
        emit(
            self.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "shared instance loaded",
            [json_str("uri", key.uri.clone()), json_kv("ttl_ms", ttl_ms)],
        );
        self.add(key.clone(), document.clone(), ttl_ms);
        Ok(document)
    }

    /// Remove every entry loaded from `uri`, whatever its options.
    pub fn remove(&self, uri: &str) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let keys: Vec<SharedInstanceKey> = entries
            .iter()
            .filter(|(k, _)| k.uri == uri)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        keys.len()
    }

    pub fn remove_all(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doc(name: &str) -> Arc<InstanceDocument> {
        Arc::new(InstanceDocument::new(name))
    }

    #[test]
    fn entries_expire_lazily() {
        let cache = SharedInstanceCache::new(4);
        let key = SharedInstanceKey::new("http://example.org/a.xml", false);
        let start = Instant::now();
        cache.add_at(key.clone(), doc("a"), 1_000, start);

        assert!(cache.find_at(&key, start + Duration::from_millis(500)).is_some());
        assert!(cache.find_at(&key, start + Duration::from_millis(1_500)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn negative_ttl_never_expires() {
        let cache = SharedInstanceCache::new(4);
        let key = SharedInstanceKey::new("u", false);
        let start = Instant::now();
        cache.add_at(key.clone(), doc("a"), -1, start);
        assert!(cache.find_at(&key, start + Duration::from_secs(86_400)).is_some());
    }

    #[test]
    fn options_are_part_of_the_key() {
        let cache = SharedInstanceCache::new(4);
        cache.add(SharedInstanceKey::new("u", false), doc("plain"), -1);
        cache.add(SharedInstanceKey::new("u", true), doc("included"), -1);
        cache.add(SharedInstanceKey::new("v", false), doc("other"), -1);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.remove("u"), 2);
        assert_eq!(cache.remove_all(), 1);
        assert_eq!(cache.remove_all(), 0);
    }

    #[test]
    fn find_or_load_loads_once() {
        let cache = SharedInstanceCache::new(4);
        let loader = MapInstanceLoader::new().with_document("u", InstanceDocument::new("codes"));
        let key = SharedInstanceKey::new("u", false);
        let first = cache.find_or_load(&key, -1, &loader).unwrap();
        let second = cache.find_or_load(&key, -1, &loader).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.loads(), 1);

        let missing = SharedInstanceKey::new("nope", false);
        assert!(matches!(
            cache.find_or_load(&missing, -1, &loader),
            Err(EngineError::InstanceLoad { .. })
        ));
    }
}
