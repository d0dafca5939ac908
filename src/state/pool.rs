use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::token::PoolKey;
use crate::error::Result;
use crate::logging::{LogLevel, Logger, emit, json_str};
use crate::metrics::{MetricsHandle, with_metrics};

const TARGET: &str = "formtree::pool";

/// Default number of distinct keys the pool keeps.
pub const DEFAULT_POOL_CAPACITY: usize = 10;

/// Pool of materialized objects keyed by the state token they were last
/// returned under.
///
/// An object is checked out by exactly one caller at a time. It goes back to
/// the pool only when the caller's work succeeds and names a destination
/// key; errors, panics and early returns discard it. Only the bookkeeping is
/// locked; the work itself runs outside the critical section.
pub struct ObjectPool<T> {
    pools: Mutex<LruCache<PoolKey, Vec<T>>>,
    logger: Option<Logger>,
    metrics: Option<MetricsHandle>,
}

/// How a checkout was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkout {
    /// Taken from the pool.
    Reused,
    /// Rebuilt because the pool had nothing under the key.
    Rebuilt,
}

impl<T> ObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            pools: Mutex::new(LruCache::new(capacity)),
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

    /// Check out the object pooled under `key` (rebuilding it on a miss),
    /// run `work` on it, and return it under the key `work` names.
    ///
    /// `work` returning `Ok((value, None))` or `Err` discards the object.
    pub fn checkout<R>(
        &self,
        key: Option<&PoolKey>,
        rebuild: impl FnOnce() -> Result<T>,
        work: impl FnOnce(&mut T, Checkout) -> Result<(R, Option<PoolKey>)>,
    ) -> Result<R> {
        let pooled = key.and_then(|k| self.take(k));
        let (mut item, how) = match pooled {
            Some(item) => {
                with_metrics(self.metrics.as_ref(), |m| m.record_pool_hit());
                (item, Checkout::Reused)
            }
            None => {
                with_metrics(self.metrics.as_ref(), |m| m.record_pool_miss());
                (rebuild()?, Checkout::Rebuilt)
            }
        };

        let guard = DiscardGuard {
            pool: self,
            armed: true,
        };
        let (value, destination) = work(&mut item, how)?;
        match destination {
            Some(destination) => {
                guard.disarm();
                if key.is_some_and(|k| *k != destination) {
                    emit(
                        self.logger.as_ref(),
                        LogLevel::Trace,
                        TARGET,
                        "object moved",
                        [json_str("to", destination.to_string())],
                    );
                }
                self.put(destination, item);
            }
            None => drop(guard),
        }
        Ok(value)
    }

    /// Drop every object pooled under `key`.
    pub fn invalidate(&self, key: &PoolKey) -> usize {
        let removed = self
            .pools
            .lock()
            .ok()
            .and_then(|mut pools| pools.pop(key))
            .map_or(0, |idle| idle.len());
        for _ in 0..removed {
            with_metrics(self.metrics.as_ref(), |m| m.record_pool_discard());
        }
        removed
    }

    pub fn idle(&self, key: &PoolKey) -> usize {
        self.pools
            .lock()
            .ok()
            .and_then(|pools| pools.peek(key).map(Vec::len))
            .unwrap_or(0)
    }

    /// Number of keys with a pool.
    pub fn len(&self) -> usize {
        self.pools.lock().map(|pools| pools.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, key: &PoolKey) -> Option<T> {
        let mut pools = self.pools.lock().ok()?;
        let idle = pools.get_mut(key)?;
        let item = idle.pop();
        if idle.is_empty() {
            pools.pop(key);
        }
        item
    }

    /// Return an idle object under `key`. The least recently used key is
    /// dropped when the pool is full.
    pub fn put(&self, key: PoolKey, item: T) {
        let Ok(mut pools) = self.pools.lock() else {
            return;
        };
        if let Some(idle) = pools.get_mut(&key) {
            idle.push(item);
            return;
        }
        let evicted = pools.push(key, vec![item]);
        drop(pools);
        if let Some((_, idle)) = evicted {
            for _ in 0..idle.len() {
                with_metrics(self.metrics.as_ref(), |m| m.record_pool_discard());
            }
        }
    }
}

/// Records a discard unless the checked-out object was returned.
struct DiscardGuard<'a, T> {
    pool: &'a ObjectPool<T>,
    armed: bool,
}

impl<T> DiscardGuard<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for DiscardGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            with_metrics(self.pool.metrics.as_ref(), |m| m.record_pool_discard());
            emit(
                self.pool.logger.as_ref(),
                LogLevel::Debug,
                TARGET,
                "checked-out object discarded",
                [json_str("reason", "not returned")],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::metrics::EngineMetrics;
    use std::cell::Cell;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn key(name: &str) -> PoolKey {
        PoolKey::of("static", name)
    }

    #[test]
    fn returned_objects_are_reused_without_rebuild() {
        let pool: ObjectPool<Vec<u32>> = ObjectPool::new(4);
        let builds = Cell::new(0);
        let rebuild = || {
            builds.set(builds.get() + 1);
            Ok(vec![1])
        };

        let how = pool
            .checkout(Some(&key("a")), rebuild, |items, how| {
                items.push(2);
                Ok((how, Some(key("a"))))
            })
            .unwrap();
        assert_eq!(how, Checkout::Rebuilt);

        let (how, seen) = pool
            .checkout(Some(&key("a")), rebuild, |items, how| {
                Ok(((how, items.clone()), Some(key("a"))))
            })
            .unwrap();
        assert_eq!(how, Checkout::Reused);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(builds.get(), 1);
    }

    #[test]
    fn objects_move_to_their_new_key() {
        let pool: ObjectPool<u32> = ObjectPool::new(4);
        pool.checkout(None, || Ok(7), |_, _| Ok(((), Some(key("b")))))
            .unwrap();
        assert_eq!(pool.idle(&key("b")), 1);
        pool.checkout(Some(&key("b")), || Ok(0), |_, _| Ok(((), Some(key("c")))))
            .unwrap();
        assert_eq!(pool.idle(&key("b")), 0);
        assert_eq!(pool.idle(&key("c")), 1);
    }

    #[test]
    fn failed_work_discards_the_object() {
        let metrics = EngineMetrics::handle();
        let pool: ObjectPool<u32> = ObjectPool::new(4).with_metrics(Some(metrics.clone()));
        pool.checkout(None, || Ok(1), |_, _| Ok(((), Some(key("a")))))
            .unwrap();
        let err = pool
            .checkout(Some(&key("a")), || Ok(0), |_, _| -> Result<((), Option<PoolKey>)> {
                Err(EngineError::InvalidStimulus("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStimulus(_)));
        assert_eq!(pool.idle(&key("a")), 0);
        let snapshot = metrics.lock().unwrap().snapshot(Duration::ZERO);
        assert_eq!(snapshot.pool_discards, 1);
        assert_eq!(snapshot.pool_hits, 1);
    }

    #[test]
    fn capacity_bounds_the_number_of_keys() {
        let pool: ObjectPool<u32> = ObjectPool::new(2);
        for name in ["a", "b", "c"] {
            pool.checkout(None, || Ok(1), |_, _| Ok(((), Some(key(name)))))
                .unwrap();
        }
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.idle(&key("a")), 0);
        assert_eq!(pool.invalidate(&key("c")), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn concurrent_checkouts_never_share_an_object() {
        let pool: ObjectPool<u32> = ObjectPool::new(4);
        pool.put(key("a"), 1);
        let both_working = Barrier::new(2);
        let (pool, both_working) = (&pool, &both_working);
        let hows: Vec<Checkout> = thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        pool.checkout(Some(&key("a")), || Ok(0), |_, how| {
                            both_working.wait();
                            Ok((how, None))
                        })
                        .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(hows.iter().filter(|h| **h == Checkout::Reused).count(), 1);
        assert_eq!(hows.iter().filter(|h| **h == Checkout::Rebuilt).count(), 1);
        assert_eq!(pool.idle(&key("a")), 0);
    }
}
