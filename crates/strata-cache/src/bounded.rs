//! Count- and cost-bounded in-memory cache
//!
//! Entries are kept in least-recently-used order. After every insert the cache evicts
//! from the cold end until both the entry count and the cumulative cost fit the
//! [`CapacityProfile`]. Eviction is deterministic, so `current_count`,
//! `current_cost` and `keys_by_recency` can be asserted in tests.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::{capacity::CapacityProfile, monitor::PerformanceMonitor};

#[derive(Debug)]
struct Costed<V> {
    value: V,
    cost: u64,
}

#[derive(Debug)]
struct BoundedInner<V> {
    entries: LruCache<String, Costed<V>>,
    total_cost: u64,
    evictions: u64,
}

impl<V> BoundedInner<V> {
    fn take(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.pop(key)?;
        self.total_cost -= entry.cost;
        Some(entry.value)
    }

    fn evict_until_within(&mut self, profile: &CapacityProfile) -> Vec<(String, V)> {
        let mut evicted = Vec::new();
        while profile.exceeds_count(self.entries.len()) || profile.exceeds_cost(self.total_cost)
        {
            match self.entries.pop_lru() {
                Some((key, entry)) => {
                    self.total_cost -= entry.cost;
                    evicted.push((key, entry.value));
                }
                None => break,
            }
        }
        self.evictions += evicted.len() as u64;
        evicted
    }
}

/// Thread-safe LRU cache bounded by entry count and total cost
#[derive(Debug)]
pub struct BoundedObjectCache<V> {
    name: String,
    profile: CapacityProfile,
    inner: Mutex<BoundedInner<V>>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl<V: Clone> BoundedObjectCache<V> {
    pub fn new(name: impl Into<String>, profile: CapacityProfile) -> Self {
        Self {
            name: name.into(),
            profile,
            inner: Mutex::new(BoundedInner {
                entries: LruCache::unbounded(),
                total_cost: 0,
                evictions: 0,
            }),
            monitor: None,
        }
    }

    /// Report hits, misses, writes and evictions to `monitor`
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Insert or replace `key`, returning whatever had to be evicted to make room
    ///
    /// An item whose own cost exceeds the cost limit is not retained and comes back
    /// in the returned list.
    pub fn set(&self, key: impl Into<String>, value: V, cost: u64) -> Vec<(String, V)> {
        let key = key.into();
        let evicted = {
            let mut inner = self.inner.lock();
            inner.take(&key);
            if self.profile.exceeds_cost(cost) {
                inner.evictions += 1;
                vec![(key, value)]
            } else {
                inner.total_cost += cost;
                inner.entries.put(key, Costed { value, cost });
                inner.evict_until_within(&self.profile)
            }
        };

        if !evicted.is_empty() {
            debug!(cache = %self.name, count = evicted.len(), "Evicted entries");
        }
        if let Some(monitor) = &self.monitor {
            monitor.record_write();
            monitor.record_evictions(evicted.len() as u64);
        }
        evicted
    }

    /// Look up `key`, marking it as most recently used
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self
            .inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.value.clone());

        if let Some(monitor) = &self.monitor {
            match value {
                Some(_) => monitor.record_hit(),
                None => monitor.record_miss(),
            }
        }
        value
    }

    /// Look up `key` without touching recency or metrics
    pub fn peek(&self, key: &str) -> Option<V> {
        self.inner
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().take(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
    }

    pub fn current_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn current_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    pub fn is_empty(&self) -> bool {
        self.current_count() == 0
    }

    /// Total number of entries evicted for capacity since creation
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    /// Keys ordered from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn profile(&self) -> CapacityProfile {
        self.profile
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
