//! Subject, period and overall averages
//!
//! Averages live in a [`DependencyCache`] keyed by scope, depending on the grade records
//! they were computed from. When a [`HierarchicalCacheManager`] is attached each average
//! is also written through to it, together with an index of its dependencies and the
//! time it was computed. The index lets an average evicted from memory, or left over
//! from a previous run, be restored with its original dependencies and remaining TTL,
//! and lets record invalidation reach copies that are no longer in memory.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    config::{ReviewSettings, TtlPolicy},
    dependency::DependencyCache,
    error::Result,
    manager::HierarchicalCacheManager,
    monitor::{OperationTimer, PerformanceMonitor},
};

/// Manager key holding the persisted average index
pub const AVERAGE_INDEX_KEY: &str = "averages_index";

pub const OVERALL_AVERAGE_KEY: &str = "overall_average";

pub fn subject_average_key(subject_id: &str) -> String {
    format!("subject_average_{}", subject_id)
}

pub fn period_average_key(period_id: &str) -> String {
    format!("period_average_{}", period_id)
}

/// What is known about a written-through average besides its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedAverage {
    dependencies: HashSet<String>,
    computed_at: DateTime<Utc>,
}

impl PersistedAverage {
    /// Time left before the average goes stale, `None` once it has
    fn remaining(&self, ttl: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let age = (now - self.computed_at).to_std().unwrap_or(Duration::ZERO);
        ttl.checked_sub(age).filter(|remaining| !remaining.is_zero())
    }
}

type AverageIndex = HashMap<String, PersistedAverage>;

/// Keys of `index` reached from `seeds`, directly or through other indexed averages
fn cascade_index(
    index: &AverageIndex,
    seeds: impl IntoIterator<Item = String>,
) -> HashSet<String> {
    let mut reached = HashSet::new();
    let mut frontier: Vec<String> = seeds.into_iter().collect();
    while let Some(id) = frontier.pop() {
        if index.contains_key(&id) {
            reached.insert(id.clone());
        }
        for (key, entry) in index {
            if entry.dependencies.contains(&id) && reached.insert(key.clone()) {
                frontier.push(key.clone());
            }
        }
    }
    reached
}

#[derive(Debug)]
pub struct AverageCache {
    ttl: TtlPolicy,
    cache: DependencyCache<f64>,
    manager: Option<Arc<HierarchicalCacheManager>>,
    /// Loaded from the manager on first use
    index: Mutex<Option<AverageIndex>>,
    monitor: Arc<PerformanceMonitor>,
}

impl AverageCache {
    pub fn new(ttl: TtlPolicy, settings: &ReviewSettings, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            ttl,
            cache: DependencyCache::new("averages", settings.average_cache, monitor.clone()),
            manager: None,
            index: Mutex::new(None),
            monitor,
        }
    }

    /// Write averages through to `manager` and restore them from it on a miss
    pub fn with_manager(mut self, manager: Arc<HierarchicalCacheManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    async fn index(
        &self,
        manager: &HierarchicalCacheManager,
    ) -> MappedMutexGuard<'_, AverageIndex> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            let loaded: AverageIndex = manager
                .load_record(AVERAGE_INDEX_KEY)
                .await
                .unwrap_or_default();
            debug!(entries = loaded.len(), "Loaded average index");
            *guard = Some(loaded);
        }
        MutexGuard::map(guard, |index| index.get_or_insert_with(AverageIndex::default))
    }

    /// Cache `value` under `key`, computed from the records in `dependencies`
    pub async fn cache_average(
        &self,
        key: &str,
        value: f64,
        dependencies: HashSet<String>,
    ) -> Result<()> {
        self.cache.put(key, value, self.ttl.averages(), dependencies.clone());
        let Some(manager) = &self.manager else {
            return Ok(());
        };

        let mut index = self.index(manager).await;
        manager.cache_value(key, value).await?;
        let now = Utc::now();
        let ttl = self.ttl.averages();
        index.retain(|_, entry| entry.remaining(ttl, now).is_some());
        index.insert(
            key.to_string(),
            PersistedAverage {
                dependencies,
                computed_at: now,
            },
        );
        manager.persist_record(AVERAGE_INDEX_KEY, &*index).await
    }

    pub async fn average(&self, key: &str) -> Option<f64> {
        if let Some(value) = self.cache.get(key) {
            return Some(value);
        }
        let manager = self.manager.as_ref()?;
        let mut index = self.index(manager).await;
        let entry = index.get(key)?.clone();

        let Some(remaining) = entry.remaining(self.ttl.averages(), Utc::now()) else {
            debug!(key = %key, "Persisted average went stale");
            index.remove(key);
            return None;
        };
        let Some(value) = manager.restore_value(key).await else {
            index.remove(key);
            return None;
        };

        self.cache.put(key, value, remaining, entry.dependencies);
        debug!(key = %key, "Average restored from manager");
        Some(value)
    }

    /// Return the cached average or compute, cache and return it
    pub async fn get_or_compute<F>(
        &self,
        key: &str,
        dependencies: HashSet<String>,
        compute: F,
    ) -> Result<f64>
    where
        F: FnOnce() -> f64,
    {
        if let Some(value) = self.average(key).await {
            return Ok(value);
        }
        let timer = OperationTimer::start();
        let value = compute();
        self.monitor.record_calculation(timer.elapsed());
        self.cache_average(key, value, dependencies).await?;
        Ok(value)
    }

    /// Drop every average derived from `record_id`, in memory and in the manager
    pub async fn invalidate_record(&self, record_id: &str) -> Vec<String> {
        let mut removed = self.cache.invalidate(record_id);
        let Some(manager) = &self.manager else {
            return removed;
        };

        let mut index = self.index(manager).await;
        let seeds = std::iter::once(record_id.to_string()).chain(removed.iter().cloned());
        let persisted = cascade_index(&index, seeds);

        // Evicted averages can still have dependents in memory
        let evicted: Vec<&str> = persisted
            .iter()
            .filter(|key| !removed.contains(key))
            .map(String::as_str)
            .collect();
        removed.extend(self.cache.invalidate_all(evicted));
        for key in persisted {
            if !removed.contains(&key) {
                removed.push(key);
            }
        }

        let indexed = index.len();
        index.retain(|key, _| !removed.contains(key));
        for key in &removed {
            if let Err(err) = manager.invalidate(key).await {
                warn!(key = %key, error = %err, "Failed to invalidate persisted average");
            }
        }
        if index.len() != indexed {
            if let Err(err) = manager.persist_record(AVERAGE_INDEX_KEY, &*index).await {
                warn!(error = %err, "Failed to persist average index");
            }
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    pub fn dependencies_of(&self, key: &str) -> Option<HashSet<String>> {
        self.cache.dependencies_of(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn purge_stale(&self) -> usize {
        self.cache.purge_stale()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capacity::{AdaptiveCapacityPlanner, CapacityProfile, DeviceMemoryTier},
        config::{CacheSettings, DiskSettings},
        dependency::dependency_set,
        disk::DiskBackedStore,
    };
    use tempfile::TempDir;

    fn averages() -> AverageCache {
        let settings = CacheSettings::default();
        AverageCache::new(
            settings.ttl,
            &settings.review,
            Arc::new(PerformanceMonitor::default()),
        )
    }

    async fn manager(dir: &TempDir) -> Arc<HierarchicalCacheManager> {
        let settings = CacheSettings::default();
        let monitor = Arc::new(PerformanceMonitor::default());
        let disk = DiskBackedStore::open(
            dir.path(),
            settings.manager.disk_budget_bytes,
            &DiskSettings::default(),
            monitor.clone(),
        );
        Arc::new(
            HierarchicalCacheManager::open(
                settings.manager,
                AdaptiveCapacityPlanner::plan_for_tier(DeviceMemoryTier::Standard),
                disk,
                monitor,
            )
            .await,
        )
    }

    fn backed_by(
        settings: &CacheSettings,
        manager: &Arc<HierarchicalCacheManager>,
    ) -> AverageCache {
        AverageCache::new(
            settings.ttl.clone(),
            &settings.review,
            manager.monitor().clone(),
        )
        .with_manager(manager.clone())
    }

    /// Persist `overall_average` = 15.0 computed from `grade_1`, then shut down
    async fn persist_overall(dir: &TempDir) {
        let manager = manager(dir).await;
        let cache = backed_by(&CacheSettings::default(), &manager);
        cache
            .cache_average(OVERALL_AVERAGE_KEY, 15.0, dependency_set(["grade_1"]))
            .await
            .unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidate_by_grade() {
        let cache = averages();
        let math = subject_average_key("math");
        cache
            .cache_average(&math, 14.5, dependency_set(["grade_1", "grade_2"]))
            .await
            .unwrap();
        cache
            .cache_average(OVERALL_AVERAGE_KEY, 13.0, dependency_set([math.clone()]))
            .await
            .unwrap();

        let mut removed = cache.invalidate_record("grade_2").await;
        removed.sort();

        assert_eq!(removed, vec![OVERALL_AVERAGE_KEY.to_string(), math]);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once() {
        let cache = averages();
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_compute("period_average_q1", dependency_set(["grade_1"]), || {
                    calls += 1;
                    12.0
                })
                .await
                .unwrap();
            assert_eq!(value, 12.0);
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_restored_average_keeps_dependencies() {
        let dir = TempDir::new().unwrap();
        persist_overall(&dir).await;

        let manager = manager(&dir).await;
        let cache = backed_by(&CacheSettings::default(), &manager);
        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, Some(15.0));
        assert_eq!(
            cache.dependencies_of(OVERALL_AVERAGE_KEY),
            Some(dependency_set(["grade_1"]))
        );

        assert!(cache.invalidate_record("grade_42").await.is_empty());
        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, Some(15.0));

        let removed = cache.invalidate_record("grade_1").await;
        assert_eq!(removed, vec![OVERALL_AVERAGE_KEY.to_string()]);
        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, None);
    }

    #[tokio::test]
    async fn test_invalidate_before_restore() {
        let dir = TempDir::new().unwrap();
        persist_overall(&dir).await;

        {
            let manager = manager(&dir).await;
            let cache = backed_by(&CacheSettings::default(), &manager);
            let removed = cache.invalidate_record("grade_1").await;

            assert_eq!(removed, vec![OVERALL_AVERAGE_KEY.to_string()]);
            assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, None);
            manager.shutdown().await;
        }

        let manager = manager(&dir).await;
        let cache = backed_by(&CacheSettings::default(), &manager);
        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, None);
    }

    #[tokio::test]
    async fn test_invalidate_after_eviction() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let mut settings = CacheSettings::default();
        settings.review.average_cache = CapacityProfile::new(1, 0);
        let cache = backed_by(&settings, &manager);
        let math = subject_average_key("math");
        let biology = subject_average_key("biology");

        cache
            .cache_average(&math, 14.5, dependency_set(["grade_1"]))
            .await
            .unwrap();
        cache
            .cache_average(&biology, 11.0, dependency_set(["grade_3"]))
            .await
            .unwrap();
        assert!(!cache.contains(&math));

        assert_eq!(cache.invalidate_record("grade_1").await, vec![math.clone()]);
        assert_eq!(cache.average(&math).await, None);
        assert_eq!(manager.get_value(&math).await, None);
        assert_eq!(cache.average(&biology).await, Some(11.0));
    }

    #[tokio::test]
    async fn test_evicted_dependent_cascades_through_index() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let mut settings = CacheSettings::default();
        settings.review.average_cache = CapacityProfile::new(1, 0);
        let cache = backed_by(&settings, &manager);
        let math = subject_average_key("math");

        cache
            .cache_average(&math, 14.5, dependency_set(["grade_1"]))
            .await
            .unwrap();
        cache
            .cache_average(OVERALL_AVERAGE_KEY, 13.0, dependency_set([math.clone()]))
            .await
            .unwrap();

        let mut removed = cache.invalidate_record("grade_1").await;
        removed.sort();

        assert_eq!(removed, vec![OVERALL_AVERAGE_KEY.to_string(), math]);
        assert!(cache.is_empty());
        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, None);
    }

    #[tokio::test]
    async fn test_persisted_average_expires_with_ttl() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let mut settings = CacheSettings::default();
        settings.ttl.averages_secs = 1;
        let cache = backed_by(&settings, &manager);
        let math = subject_average_key("math");

        cache
            .cache_average(&math, 14.5, dependency_set(["grade_1"]))
            .await
            .unwrap();
        assert_eq!(cache.average(&math).await, Some(14.5));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.average(&math).await, None);
        assert_eq!(cache.average(&math).await, None);
    }

    #[tokio::test]
    async fn test_restore_counts_one_request() {
        let dir = TempDir::new().unwrap();
        persist_overall(&dir).await;

        let manager = manager(&dir).await;
        let cache = backed_by(&CacheSettings::default(), &manager);
        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, Some(15.0));
        assert_eq!(manager.monitor().snapshot().requests(), 1);

        assert_eq!(cache.average(OVERALL_AVERAGE_KEY).await, Some(15.0));
        let snapshot = manager.monitor().snapshot();
        assert_eq!((snapshot.hits, snapshot.misses), (1, 1));
    }

    #[test]
    fn test_remaining_ttl() {
        let now = Utc::now();
        let entry = PersistedAverage {
            dependencies: HashSet::new(),
            computed_at: now - chrono::Duration::seconds(100),
        };
        let ttl = Duration::from_secs(300);

        assert_eq!(entry.remaining(ttl, now), Some(Duration::from_secs(200)));
        assert_eq!(
            entry.remaining(ttl, now + chrono::Duration::seconds(200)),
            None
        );
    }
}
