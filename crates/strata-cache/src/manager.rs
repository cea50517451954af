//! Application-facing hierarchical cache
//!
//! Three memory tiers sit in front of one disk directory:
//!
//! - **values**: scalar results such as averages, the most valuable tier
//! - **objects**: arbitrary shared objects, sized by the device capacity plan
//! - **assets**: raw byte buffers
//!
//! Values whose key matches a persistent pattern are written through to disk, and the
//! configured critical keys are reloaded on startup. Under memory pressure the
//! object and asset tiers are dropped while the value tier is kept.

use std::{
    any::Any,
    sync::{Arc, Weak},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    bounded::BoundedObjectCache,
    capacity::{CapacityPlan, DeviceMemoryTier},
    config::ManagerSettings,
    disk::DiskBackedStore,
    error::{validate_key, Result},
    monitor::{HealthStatus, OperationTimer, PerformanceMonitor, PerformanceSnapshot},
    pressure::MemoryPressure,
};

/// Type-erased object stored in the object tier
pub type SharedObject = Arc<dyn Any + Send + Sync>;

/// Sizes of each tier plus monitor output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub device_tier: DeviceMemoryTier,
    pub value_count: usize,
    pub value_bytes: u64,
    pub object_count: usize,
    pub object_bytes: u64,
    pub asset_count: usize,
    pub asset_bytes: u64,
    pub disk_bytes: u64,
    pub health: HealthStatus,
    pub performance: PerformanceSnapshot,
}

/// General-purpose cache facade
#[derive(Debug)]
pub struct HierarchicalCacheManager {
    settings: ManagerSettings,
    plan: CapacityPlan,
    values: BoundedObjectCache<f64>,
    objects: BoundedObjectCache<SharedObject>,
    assets: BoundedObjectCache<Arc<[u8]>>,
    disk: DiskBackedStore,
    monitor: Arc<PerformanceMonitor>,
}

impl HierarchicalCacheManager {
    /// Build the manager and warm the value tier with the critical keys found on disk
    pub async fn open(
        settings: ManagerSettings,
        plan: CapacityPlan,
        disk: DiskBackedStore,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let manager = Self {
            values: BoundedObjectCache::new("values", settings.value_cache)
                .with_monitor(monitor.clone()),
            objects: BoundedObjectCache::new("objects", plan.objects)
                .with_monitor(monitor.clone()),
            assets: BoundedObjectCache::new("assets", settings.asset_cache)
                .with_monitor(monitor.clone()),
            settings,
            plan,
            disk,
            monitor,
        };
        let loaded = manager.load_critical().await;
        info!(
            tier = manager.plan.tier.as_str(),
            critical_loaded = loaded,
            "Cache manager ready"
        );
        manager
    }

    /// Cache a scalar, writing it through to disk if its key is persistent
    pub async fn cache_value(&self, key: &str, value: f64) -> Result<()> {
        validate_key(key)?;
        self.values
            .set(key, value, std::mem::size_of::<f64>() as u64 + key.len() as u64);

        if self.settings.is_persistent(key) {
            self.persist_value(key, value).await?;
        }
        Ok(())
    }

    /// Look up a scalar in memory, then on disk
    pub async fn get_value(&self, key: &str) -> Option<f64> {
        let timer = OperationTimer::start();
        let value = match self.values.get(key) {
            Some(value) => Some(value),
            None => self.load_value(key).await,
        };
        self.monitor.record_latency(timer.elapsed());
        value
    }

    /// Like [`HierarchicalCacheManager::get_value`] without recording a request
    ///
    /// For callers that already counted the lookup in their own tier.
    pub async fn restore_value(&self, key: &str) -> Option<f64> {
        match self.values.peek(key) {
            Some(value) => Some(value),
            None => self.load_value(key).await,
        }
    }

    /// Write a serializable record straight to disk
    pub async fn persist_record<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.disk
            .store(key, bytes, self.settings.persisted_ttl())
            .await
    }

    /// Read a record written by [`HierarchicalCacheManager::persist_record`]
    pub async fn load_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.disk.retrieve(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(key = %key, error = %err, "Undecodable cached record");
                None
            }
        }
    }

    async fn load_value(&self, key: &str) -> Option<f64> {
        let bytes = self.disk.retrieve(key).await?;
        match serde_json::from_slice::<f64>(&bytes) {
            Ok(value) => {
                self.values
                    .set(key, value, std::mem::size_of::<f64>() as u64 + key.len() as u64);
                debug!(key = %key, "Value restored from disk");
                Some(value)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Undecodable cached value");
                None
            }
        }
    }

    async fn persist_value(&self, key: &str, value: f64) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        self.disk
            .store(key, bytes, self.settings.persisted_ttl())
            .await
    }

    /// Cache an object with an explicit cost in bytes
    pub fn cache_object<T: Any + Send + Sync>(&self, key: &str, object: T, cost: u64) {
        self.cache_shared(key, Arc::new(object), cost);
    }

    /// Cache an already shared object
    pub fn cache_shared<T: Any + Send + Sync>(&self, key: &str, object: Arc<T>, cost: u64) {
        let object: SharedObject = object;
        self.objects.set(key, object, cost);
    }

    /// Look up an object of type `T`; a stored object of another type is a miss
    pub fn get_object<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.objects.get(key)?.downcast::<T>().ok()
    }

    pub fn cache_asset(&self, key: &str, bytes: Vec<u8>) {
        let cost = bytes.len() as u64;
        self.assets.set(key, Arc::from(bytes), cost);
    }

    pub fn get_asset(&self, key: &str) -> Option<Arc<[u8]>> {
        self.assets.get(key)
    }

    /// Remove `key` from every tier, including disk
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        self.objects.remove(key);
        self.assets.remove(key);
        self.disk.remove(key).await
    }

    /// Empty every memory tier and the disk directory
    pub async fn clear_all(&self) {
        self.values.clear();
        self.objects.clear();
        self.assets.clear();
        self.disk.clear().await;
        info!("Cleared all cache tiers");
    }

    /// Write the critical keys currently in memory to disk
    pub async fn persist_critical(&self) -> usize {
        let mut persisted = 0;
        for key in &self.settings.critical_keys {
            let Some(value) = self.values.peek(key) else {
                continue;
            };
            match self.persist_value(key, value).await {
                Ok(()) => persisted += 1,
                Err(err) => warn!(key = %key, error = %err, "Failed to persist critical key"),
            }
        }
        debug!(persisted, "Persisted critical keys");
        persisted
    }

    /// Reload critical keys from disk into the value tier
    pub async fn load_critical(&self) -> usize {
        let keys = self.settings.critical_keys.clone();
        self.prefetch(&keys).await
    }

    /// Pull `keys` from disk into memory if they are not already cached
    pub async fn prefetch(&self, keys: &[String]) -> usize {
        let mut loaded = 0;
        for key in keys {
            if self.values.contains(key) {
                continue;
            }
            if self.load_value(key).await.is_some() {
                loaded += 1;
            }
        }
        loaded
    }

    /// Persist critical keys, then drop the object and asset tiers
    pub async fn handle_memory_pressure(&self) {
        let persisted = self.persist_critical().await;
        let objects = self.objects.current_count();
        let assets = self.assets.current_count();
        self.objects.clear();
        self.assets.clear();
        info!(
            persisted,
            objects, assets, "Memory pressure: released object and asset tiers"
        );
    }

    /// React to memory-pressure notifications until the channel closes
    pub fn attach_memory_pressure(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<MemoryPressure>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        match manager.upgrade() {
                            Some(manager) => manager.handle_memory_pressure().await,
                            None => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Persist critical keys and wait for pending disk writes
    pub async fn shutdown(&self) {
        self.persist_critical().await;
        self.disk.flush().await;
    }

    /// Sweep expired values from disk
    pub async fn cleanup_expired(&self) -> usize {
        self.disk.cleanup_expired().await
    }

    pub fn capacity_plan(&self) -> &CapacityPlan {
        &self.plan
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            device_tier: self.plan.tier,
            value_count: self.values.current_count(),
            value_bytes: self.values.current_cost(),
            object_count: self.objects.current_count(),
            object_bytes: self.objects.current_cost(),
            asset_count: self.assets.current_count(),
            asset_bytes: self.assets.current_cost(),
            disk_bytes: self.disk.current_size().await,
            health: self.monitor.health(),
            performance: self.monitor.snapshot(),
        }
    }

    /// Human-readable report of tier sizes and performance
    pub async fn report(&self) -> String {
        let stats = self.stats().await;
        format!(
            "Cache Manager ({}):\n  Values: {} ({} bytes)\n  Objects: {} ({} bytes)\n  Assets: {} ({} bytes)\n  Disk: {} bytes\n{}",
            stats.device_tier.as_str(),
            stats.value_count,
            stats.value_bytes,
            stats.object_count,
            stats.object_bytes,
            stats.asset_count,
            stats.asset_bytes,
            stats.disk_bytes,
            self.monitor.report(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capacity::AdaptiveCapacityPlanner, config::DiskSettings};
    use std::path::Path;
    use tempfile::tempdir;

    async fn open(dir: &Path) -> HierarchicalCacheManager {
        let monitor = Arc::new(PerformanceMonitor::default());
        let settings = ManagerSettings::default();
        let disk = DiskBackedStore::open(
            dir.join("values"),
            settings.disk_budget_bytes,
            &DiskSettings::default(),
            monitor.clone(),
        );
        let plan = AdaptiveCapacityPlanner::plan_for_tier(DeviceMemoryTier::Compact);
        HierarchicalCacheManager::open(settings, plan, disk, monitor).await
    }

    #[derive(Debug, PartialEq)]
    struct Deck {
        title: String,
    }

    #[tokio::test]
    async fn test_value_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;

        manager.cache_value("deck_count", 12.0).await.unwrap();
        assert_eq!(manager.get_value("deck_count").await, Some(12.0));
        assert_eq!(manager.get_value("unknown").await, None);
    }

    #[tokio::test]
    async fn test_persistent_values_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let manager = open(dir.path()).await;
            manager.cache_value("overall_average", 14.2).await.unwrap();
            manager.cache_value("session_counter", 3.0).await.unwrap();
            manager.shutdown().await;
        }

        let manager = open(dir.path()).await;
        assert_eq!(manager.stats().await.value_count, 1);
        assert_eq!(manager.get_value("overall_average").await, Some(14.2));
        assert_eq!(manager.get_value("session_counter").await, None);
    }

    #[tokio::test]
    async fn test_disk_fallback_repopulates_memory() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_value("grade_math", 16.0).await.unwrap();
        manager.values.clear();

        assert_eq!(manager.get_value("grade_math").await, Some(16.0));
        assert!(manager.values.contains("grade_math"));
    }

    #[tokio::test]
    async fn test_restore_value_records_nothing() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_value("grade_math", 16.0).await.unwrap();
        manager.values.clear();

        assert_eq!(manager.restore_value("grade_math").await, Some(16.0));
        assert_eq!(manager.restore_value("grade_math").await, Some(16.0));
        assert_eq!(manager.restore_value("absent").await, None);
        assert_eq!(manager.monitor().snapshot().requests(), 0);
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        let record = vec!["grade_1".to_string(), "grade_2".to_string()];

        manager.persist_record("grade_index", &record).await.unwrap();

        assert_eq!(
            manager.load_record::<Vec<String>>("grade_index").await,
            Some(record)
        );
        assert_eq!(manager.load_record::<Vec<String>>("absent").await, None);
    }

    #[tokio::test]
    async fn test_objects_are_typed() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_object(
            "deck_1",
            Deck {
                title: "Anatomy".to_string(),
            },
            64,
        );

        let deck = manager.get_object::<Deck>("deck_1").unwrap();
        assert_eq!(deck.title, "Anatomy");
        assert!(manager.get_object::<String>("deck_1").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_everywhere() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_value("subject_average", 11.0).await.unwrap();
        manager.cache_asset("subject_average", vec![1, 2, 3]);

        manager.invalidate("subject_average").await.unwrap();

        assert_eq!(manager.get_value("subject_average").await, None);
        assert!(manager.get_asset("subject_average").is_none());
    }

    #[tokio::test]
    async fn test_memory_pressure_keeps_values() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_value("current_semester_average", 13.0).await.unwrap();
        manager.cache_object("deck", 5u32, 4);
        manager.cache_asset("cover", vec![0; 16]);

        manager.handle_memory_pressure().await;

        assert_eq!(manager.get_value("current_semester_average").await, Some(13.0));
        assert!(manager.get_object::<u32>("deck").is_none());
        assert!(manager.get_asset("cover").is_none());
    }

    #[tokio::test]
    async fn test_clear_all_twice() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_value("overall_average", 15.0).await.unwrap();

        manager.clear_all().await;
        manager.clear_all().await;

        assert_eq!(manager.get_value("overall_average").await, None);
        let stats = manager.stats().await;
        assert_eq!(stats.value_count, 0);
        assert_eq!(stats.disk_bytes, 0);
    }

    #[tokio::test]
    async fn test_malformed_key_rejected() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;

        assert!(manager.cache_value("../average", 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_report() {
        let dir = tempdir().unwrap();
        let manager = open(dir.path()).await;
        manager.cache_value("grade", 10.0).await.unwrap();
        manager.get_value("grade").await;

        let report = manager.report().await;
        assert!(report.contains("Cache Manager (compact)"));
        assert!(report.contains("Values: 1"));
    }
}
