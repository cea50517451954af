//! Composition root
//!
//! [`CacheServices`] builds every cache once, shares a single monitor between them and
//! wires them to one memory-pressure notifier. Hosts hold the returned value and pass
//! references down instead of reaching for globals.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    averages::AverageCache,
    capacity::{AdaptiveCapacityPlanner, CapacityPlan},
    config::CacheSettings,
    disk::DiskBackedStore,
    error::Result,
    manager::HierarchicalCacheManager,
    media::TieredMediaCache,
    monitor::PerformanceMonitor,
    pressure::{MemoryPressure, MemoryPressureNotifier, MemoryPressureWatcher},
    review::ReviewCache,
};

pub const VALUES_DIR: &str = "values";
pub const MEDIA_DIR: &str = "media";

/// Entries removed by one [`CacheServices::maintenance`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub stale_averages: usize,
    pub stale_reviews: usize,
    pub expired_values: usize,
    pub expired_media: usize,
}

/// Every cache of the application, built from one [`CacheSettings`]
pub struct CacheServices {
    settings: CacheSettings,
    root_dir: PathBuf,
    monitor: Arc<PerformanceMonitor>,
    notifier: Arc<MemoryPressureNotifier>,
    manager: Arc<HierarchicalCacheManager>,
    media: Arc<TieredMediaCache>,
    averages: AverageCache,
    reviews: ReviewCache,
    listeners: Vec<JoinHandle<()>>,
    watcher: Option<MemoryPressureWatcher>,
}

impl CacheServices {
    /// Build all caches under `root_dir`
    ///
    /// Must be called from within a Tokio runtime; disk workers and pressure listeners
    /// are spawned on it.
    pub async fn initialize(settings: CacheSettings, root_dir: impl Into<PathBuf>) -> Result<Self> {
        settings.validate()?;
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await?;

        let plan = match settings.memory_tier_override {
            Some(tier) => AdaptiveCapacityPlanner::plan_for_tier(tier),
            None => AdaptiveCapacityPlanner::plan_for_device(),
        };
        let monitor = Arc::new(PerformanceMonitor::new(settings.monitor.clone()));

        let value_disk = DiskBackedStore::open(
            root_dir.join(VALUES_DIR),
            settings.manager.disk_budget_bytes,
            &settings.disk,
            monitor.clone(),
        );
        let media_disk = DiskBackedStore::open(
            root_dir.join(MEDIA_DIR),
            plan.media_disk_budget_bytes,
            &settings.disk,
            monitor.clone(),
        );

        let manager = Arc::new(
            HierarchicalCacheManager::open(
                settings.manager.clone(),
                plan,
                value_disk,
                monitor.clone(),
            )
            .await,
        );
        let media = Arc::new(TieredMediaCache::new(
            settings.media.clone(),
            &plan,
            media_disk,
            monitor.clone(),
        ));
        let averages = AverageCache::new(settings.ttl.clone(), &settings.review, monitor.clone())
            .with_manager(manager.clone());
        let reviews = ReviewCache::new(settings.ttl.clone(), &settings.review, monitor.clone());

        let notifier = Arc::new(MemoryPressureNotifier::new());
        let listeners = vec![
            manager.attach_memory_pressure(notifier.subscribe()),
            media.attach_memory_pressure(notifier.subscribe()),
        ];

        info!(
            root = %root_dir.display(),
            tier = plan.tier.as_str(),
            "Cache services initialized"
        );

        Ok(Self {
            settings,
            root_dir,
            monitor,
            notifier,
            manager,
            media,
            averages,
            reviews,
            listeners,
            watcher: None,
        })
    }

    /// Start polling system memory; a second call is a no-op
    pub fn start_pressure_watcher(&mut self) {
        if self.watcher.is_none() {
            self.watcher = Some(MemoryPressureWatcher::start(
                &self.settings.pressure,
                self.notifier.clone(),
            ));
        }
    }

    /// Forward a host low-memory signal to every cache
    pub fn notify_memory_pressure(&self, level: MemoryPressure) -> usize {
        self.notifier.notify(level)
    }

    /// Drop stale derived values and sweep expired files
    pub async fn maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            stale_averages: self.averages.purge_stale(),
            stale_reviews: self.reviews.purge_stale(),
            expired_values: self.manager.cleanup_expired().await,
            expired_media: self.media.cleanup_expired().await,
        };
        info!(?report, "Cache maintenance finished");
        report
    }

    /// Human-readable report of every tier
    pub async fn report(&self) -> String {
        let media = self.media.stats();
        let reviews = self.reviews.metrics();
        format!(
            "{}\nMedia: {} memory hits, {} disk hits, {} misses ({:.1}% hit ratio)\nReview caches: {} results, {} selections, {} stats\nAverages: {}",
            self.manager.report().await,
            media.memory_hits,
            media.disk_hits,
            media.misses,
            media.hit_ratio() * 100.0,
            reviews.results,
            reviews.selections,
            reviews.stats,
            self.averages.len(),
        )
    }

    /// Stop background tasks, persist critical values and flush disk writes
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.media.cancel_all_preloads();
        self.manager.shutdown().await;
        self.media.disk().flush().await;
        info!("Cache services shut down");
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn capacity_plan(&self) -> &CapacityPlan {
        self.manager.capacity_plan()
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn notifier(&self) -> &Arc<MemoryPressureNotifier> {
        &self.notifier
    }

    pub fn manager(&self) -> &Arc<HierarchicalCacheManager> {
        &self.manager
    }

    pub fn media(&self) -> &Arc<TieredMediaCache> {
        &self.media
    }

    pub fn averages(&self) -> &AverageCache {
        &self.averages
    }

    pub fn reviews(&self) -> &ReviewCache {
        &self.reviews
    }
}
