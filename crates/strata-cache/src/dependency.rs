//! TTL cache for derived values with dependency-driven invalidation
//!
//! Every entry carries a time-to-live and the set of upstream dependency IDs it was
//! computed from. Invalidating an ID removes every entry that depends on it, and
//! transitively every entry that depends on those entries.
//!
//! Mutations (`put`, `invalidate`, stale eviction, `clear`) hold the graph write lock
//! for their whole duration, so a `get` issued after one of them returns never sees
//! the state from before it. Reads share the read lock.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    bounded::BoundedObjectCache, capacity::CapacityProfile, graph::DependencyGraph,
    monitor::PerformanceMonitor,
};

/// An immutable cached value
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// Creation time, used for staleness checks
    pub timestamp: Instant,
    pub ttl: Duration,
    pub dependencies: HashSet<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration, dependencies: HashSet<String>) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
            ttl,
            dependencies,
        }
    }

    /// An entry is stale once strictly more than `ttl` has elapsed. At exactly
    /// `ttl` it is still served.
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) > self.ttl
    }
}

/// Build a dependency set from string-like IDs
pub fn dependency_set<I, S>(ids: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter().map(Into::into).collect()
}

/// Cache of derived values keyed by semantic key
#[derive(Debug)]
pub struct DependencyCache<V> {
    name: String,
    graph: RwLock<DependencyGraph>,
    entries: BoundedObjectCache<Arc<CacheEntry<V>>>,
    monitor: Arc<PerformanceMonitor>,
}

impl<V: Clone> DependencyCache<V> {
    pub fn new(
        name: impl Into<String>,
        profile: CapacityProfile,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let name = name.into();
        Self {
            entries: BoundedObjectCache::new(name.clone(), profile),
            name,
            graph: RwLock::new(DependencyGraph::new()),
            monitor,
        }
    }

    /// Cache `value` under `key` for `ttl`, depending on `dependencies`
    pub fn put(&self, key: &str, value: V, ttl: Duration, dependencies: HashSet<String>) {
        let cost = estimate_cost::<V>(key, &dependencies);
        self.put_with_cost(key, value, ttl, dependencies, cost);
    }

    /// Like [`DependencyCache::put`] with an explicit capacity cost
    pub fn put_with_cost(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        dependencies: HashSet<String>,
        cost: u64,
    ) {
        let entry = Arc::new(CacheEntry::new(value, ttl, dependencies.clone()));
        let mut graph = self.graph.write();
        graph.insert(key, dependencies);
        let evicted = self.entries.set(key, entry, cost);
        for (evicted_key, _) in &evicted {
            graph.remove(evicted_key);
        }

        self.monitor.record_write();
        self.monitor.record_evictions(evicted.len() as u64);
    }

    /// Fetch `key`, evicting it if it has gone stale
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = {
            let _graph = self.graph.read();
            self.entries.get(key)
        };

        let Some(entry) = entry else {
            self.monitor.record_miss();
            return None;
        };

        if entry.is_stale(Instant::now()) {
            let mut graph = self.graph.write();
            // Only drop the exact entry we saw; a concurrent put may have refreshed it
            if let Some(current) = self.entries.peek(key) {
                if Arc::ptr_eq(&current, &entry) {
                    self.entries.remove(key);
                    graph.remove(key);
                    debug!(cache = %self.name, key = %key, "Evicted stale entry");
                }
            }
            self.monitor.record_miss();
            return None;
        }

        self.monitor.record_hit();
        Some(entry.value.clone())
    }

    /// Remove every entry depending on `dependency`, directly or transitively
    ///
    /// If `dependency` is itself a cached key it is removed as well. Returns the
    /// removed keys.
    pub fn invalidate(&self, dependency: &str) -> Vec<String> {
        self.invalidate_all([dependency])
    }

    /// Invalidate several dependency IDs under one write lock
    pub fn invalidate_all<'a>(
        &self,
        dependencies: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let mut graph = self.graph.write();
        let mut removed = Vec::new();
        for dependency in dependencies {
            let cascaded = self.cascade_remove(&mut graph, dependency);
            if !cascaded.is_empty() {
                debug!(
                    cache = %self.name,
                    dependency = %dependency,
                    removed = cascaded.len(),
                    "Cascade invalidation"
                );
            }
            removed.extend(cascaded);
        }
        removed
    }

    /// Remove the entries reached from `dependency` that are still present
    fn cascade_remove(&self, graph: &mut DependencyGraph, dependency: &str) -> Vec<String> {
        let mut affected = graph.cascade(dependency);
        if graph.contains(dependency) {
            affected.push(dependency.to_string());
        }
        affected
            .into_iter()
            .filter(|key| {
                let present = graph.remove(key).is_some();
                if present {
                    self.entries.remove(key);
                }
                present
            })
            .collect()
    }

    /// Remove a single key without cascading
    pub fn remove(&self, key: &str) -> bool {
        let mut graph = self.graph.write();
        graph.remove(key);
        self.entries.remove(key).is_some()
    }

    /// Drop every stale entry, returning how many were removed
    pub fn purge_stale(&self) -> usize {
        let now = Instant::now();
        let mut graph = self.graph.write();
        let stale: Vec<String> = self
            .entries
            .keys_by_recency()
            .into_iter()
            .filter(|key| {
                self.entries
                    .peek(key)
                    .map(|entry| entry.is_stale(now))
                    .unwrap_or(false)
            })
            .collect();
        for key in &stale {
            self.entries.remove(key);
            graph.remove(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        let mut graph = self.graph.write();
        self.entries.clear();
        graph.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn dependencies_of(&self, key: &str) -> Option<HashSet<String>> {
        self.graph.read().dependencies_of(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.current_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys tracked by the dependency graph
    pub fn graph_len(&self) -> usize {
        self.graph.read().len()
    }

    pub fn current_cost(&self) -> u64 {
        self.entries.current_cost()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether every cached key has a graph entry and vice versa
    pub fn is_consistent(&self) -> bool {
        let graph = self.graph.read();
        let keys = self.entries.keys_by_recency();
        keys.len() == graph.len() && keys.iter().all(|key| graph.contains(key))
    }
}

fn estimate_cost<V>(key: &str, dependencies: &HashSet<String>) -> u64 {
    let dependency_bytes: usize = dependencies.iter().map(String::len).sum();
    (std::mem::size_of::<CacheEntry<V>>() + key.len() + dependency_bytes) as u64
}
