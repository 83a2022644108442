use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use ft_problem::Fingerprint;

use crate::ExecutionPlan;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct Entry {
    plan: Arc<ExecutionPlan>,
    last_used: AtomicU64,
}

/// Bounded, least-recently-used map from scoped fingerprints to plans.
///
/// Lookups share a read lock and only touch atomics. Two threads that miss
/// on the same key may both build a plan; the first insert wins and the
/// second caller receives the cached plan.
#[derive(Debug)]
pub struct PlanCache {
    capacity: usize,
    entries: RwLock<HashMap<Fingerprint, Entry>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl PlanCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<ExecutionPlan>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) => {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.plan))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `plan` unless `key` is already present, evicting the least
    /// recently used entries to stay within capacity. Returns the plan now
    /// associated with `key`.
    pub fn insert(&self, key: Fingerprint, plan: ExecutionPlan) -> Arc<ExecutionPlan> {
        let plan = Arc::new(plan);
        if self.capacity == 0 {
            return plan;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            existing.last_used.store(self.tick(), Ordering::Relaxed);
            return Arc::clone(&existing.plan);
        }
        while entries.len() >= self.capacity {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.insert(
            key,
            Entry {
                plan: Arc::clone(&plan),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.inserts.fetch_add(1, Ordering::Relaxed);
        plan
    }

    /// Presence check that leaves recency and statistics untouched.
    #[must_use]
    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Drops every plan; returns how many were held.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use ft_problem::Fingerprint;

    use super::PlanCache;
    use crate::ExecutionPlan;

    fn plan(id: &'static str) -> ExecutionPlan {
        ExecutionPlan::new(id, Vec::new(), 0, |_, _| Ok(()))
    }

    fn key(name: &str) -> Fingerprint {
        Fingerprint::new(name)
    }

    #[test]
    fn miss_then_hit_is_counted() {
        let cache = PlanCache::new(4);
        assert!(cache.get(&key("a")).is_none());
        cache.insert(key("a"), plan("first"));
        let hit = cache.get(&key("a")).expect("inserted plan is cached");
        assert_eq!(hit.solver_id(), "first");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.inserts), (1, 1, 1));
        assert_eq!(stats.len, 1);
        assert_eq!(stats.capacity, 4);
    }

    #[test]
    fn duplicate_insert_keeps_first_plan() {
        let cache = PlanCache::new(4);
        let first = cache.insert(key("a"), plan("first"));
        let second = cache.insert(key("a"), plan("second"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.solver_id(), "first");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().inserts, 1);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = PlanCache::new(2);
        cache.insert(key("a"), plan("a"));
        cache.insert(key("b"), plan("b"));
        assert!(cache.get(&key("a")).is_some());
        cache.insert(key("c"), plan("c"));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn zero_capacity_never_stores() {
        let cache = PlanCache::new(0);
        let returned = cache.insert(key("a"), plan("a"));
        assert_eq!(returned.solver_id(), "a");
        assert!(cache.is_empty());
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn clear_reports_dropped_plans() {
        let cache = PlanCache::default();
        cache.insert(key("a"), plan("a"));
        cache.insert(key("b"), plan("b"));
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), PlanCache::DEFAULT_CAPACITY);
    }

    #[test]
    fn racing_first_builds_converge_on_one_plan() {
        let cache = PlanCache::new(8);
        let plans: Vec<Arc<ExecutionPlan>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = &cache;
                    scope.spawn(move || match cache.get(&key("shared")) {
                        Some(plan) => plan,
                        None => cache.insert(key("shared"), plan("built")),
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker should not panic"))
                .collect()
        });

        assert_eq!(cache.len(), 1);
        let cached = cache.get(&key("shared")).expect("plan is cached");
        assert!(plans.iter().all(|plan| Arc::ptr_eq(plan, &cached)));
    }
}
