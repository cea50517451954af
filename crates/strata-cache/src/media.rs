//! Memory and disk cache for images, audio and thumbnails
//!
//! Each media kind has its own bounded memory tier. Everything is also written to a
//! shared [`DiskBackedStore`] with a kind-specific TTL and key prefix. Reads check
//! memory first, then disk, repopulating memory on a disk hit.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    bounded::BoundedObjectCache,
    capacity::CapacityPlan,
    compression::{gunzip, gzip, ImageCompressor},
    config::MediaSettings,
    disk::DiskBackedStore,
    error::Result,
    graph::DependencyGraph,
    monitor::{OperationTimer, PerformanceMonitor},
    pressure::MemoryPressure,
};

/// Shared bytes held by the memory tiers
pub type MediaBytes = Arc<[u8]>;

/// Kind of cached media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Thumbnail,
    /// Arbitrary blob, gzip-compressed on disk and never held in memory
    Compressed,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Image,
        MediaKind::Audio,
        MediaKind::Thumbnail,
        MediaKind::Compressed,
    ];

    pub fn disk_prefix(&self) -> &'static str {
        match self {
            MediaKind::Image => "img_",
            MediaKind::Audio => "audio_",
            MediaKind::Thumbnail => "thumb_",
            MediaKind::Compressed => "blob_",
        }
    }

    pub fn disk_key(&self, key: &str) -> String {
        format!("{}{}", self.disk_prefix(), key)
    }

    pub fn ttl(&self, settings: &MediaSettings) -> Duration {
        let days = match self {
            MediaKind::Image => settings.image_ttl_days,
            MediaKind::Audio => settings.audio_ttl_days,
            MediaKind::Thumbnail => settings.thumbnail_ttl_days,
            MediaKind::Compressed => settings.compressed_ttl_days,
        };
        MediaSettings::ttl_days(days)
    }
}

/// Preload urgency, mapped to a start delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPriority {
    High,
    Utility,
    Background,
}

impl PreloadPriority {
    pub fn start_delay(&self) -> Duration {
        match self {
            PreloadPriority::High => Duration::ZERO,
            PreloadPriority::Utility => Duration::from_millis(100),
            PreloadPriority::Background => Duration::from_millis(250),
        }
    }
}

/// Supplies media bytes for preloading
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Load `key`, or `None` if the source has nothing for it
    async fn load(&self, kind: MediaKind, key: &str) -> Option<Vec<u8>>;
}

/// Counters reported by [`TieredMediaCache::stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub disk_writes: u64,
    pub memory_warnings: u64,
    pub cancelled_preloads: u64,
    pub active_preloads: usize,
    pub image_count: usize,
    pub image_bytes: u64,
    pub audio_count: usize,
    pub audio_bytes: u64,
    pub thumbnail_count: usize,
    pub thumbnail_bytes: u64,
}

impl MediaCacheStats {
    /// Share of lookups served from memory or disk, 0.0 to 1.0
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct MediaCounters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    disk_writes: AtomicU64,
    memory_warnings: AtomicU64,
    cancelled_preloads: AtomicU64,
}

#[derive(Debug)]
struct PreloadTask {
    id: u64,
    handle: JoinHandle<()>,
}

/// Tiered media cache
#[derive(Debug)]
pub struct TieredMediaCache {
    settings: MediaSettings,
    compressor: ImageCompressor,
    images: BoundedObjectCache<MediaBytes>,
    audio: BoundedObjectCache<MediaBytes>,
    thumbnails: BoundedObjectCache<MediaBytes>,
    disk: DiskBackedStore,
    graph: RwLock<DependencyGraph>,
    preloads: Mutex<HashMap<String, PreloadTask>>,
    next_preload_id: AtomicU64,
    counters: MediaCounters,
    monitor: Arc<PerformanceMonitor>,
}

impl TieredMediaCache {
    pub fn new(
        settings: MediaSettings,
        plan: &CapacityPlan,
        disk: DiskBackedStore,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            compressor: ImageCompressor::new(settings.clone()),
            settings,
            images: BoundedObjectCache::new("images", plan.images).with_monitor(monitor.clone()),
            audio: BoundedObjectCache::new("audio", plan.audio).with_monitor(monitor.clone()),
            thumbnails: BoundedObjectCache::new("thumbnails", plan.thumbnails)
                .with_monitor(monitor.clone()),
            disk,
            graph: RwLock::new(DependencyGraph::new()),
            preloads: Mutex::new(HashMap::new()),
            next_preload_id: AtomicU64::new(0),
            counters: MediaCounters::default(),
            monitor,
        }
    }

    fn memory_tier(&self, kind: MediaKind) -> Option<&BoundedObjectCache<MediaBytes>> {
        match kind {
            MediaKind::Image => Some(&self.images),
            MediaKind::Audio => Some(&self.audio),
            MediaKind::Thumbnail => Some(&self.thumbnails),
            MediaKind::Compressed => None,
        }
    }

    fn fits_in_memory(&self, kind: MediaKind, len: usize) -> bool {
        let len = len as u64;
        match kind {
            MediaKind::Image => len < self.settings.image_memory_threshold_bytes,
            MediaKind::Audio => len < self.settings.audio_memory_threshold_bytes,
            MediaKind::Thumbnail => true,
            MediaKind::Compressed => false,
        }
    }

    /// Compress and cache an image
    ///
    /// Fails only when `bytes` is not a decodable image or `key` is malformed.
    pub async fn store_image(&self, bytes: &[u8], key: &str) -> Result<()> {
        let compressed = self.compressor.compress(bytes)?;
        self.store(MediaKind::Image, compressed, key).await
    }

    pub async fn store_audio(&self, bytes: Vec<u8>, key: &str) -> Result<()> {
        self.store(MediaKind::Audio, bytes, key).await
    }

    /// Generate a thumbnail from a full image and cache it
    pub async fn store_thumbnail(&self, image_bytes: &[u8], key: &str) -> Result<()> {
        let thumbnail = self.compressor.thumbnail(image_bytes)?;
        self.store(MediaKind::Thumbnail, thumbnail, key).await
    }

    /// Cache an arbitrary blob on disk only, gzip-compressed
    pub async fn store_compressed(&self, bytes: &[u8], key: &str) -> Result<()> {
        let compressed = gzip(bytes)?;
        self.store(MediaKind::Compressed, compressed, key).await
    }

    /// Cache already-encoded bytes as `kind`
    ///
    /// Small enough items go to the memory tier; everything goes to disk.
    pub async fn store(&self, kind: MediaKind, bytes: Vec<u8>, key: &str) -> Result<()> {
        let disk_key = kind.disk_key(key);
        crate::error::validate_key(&disk_key)?;

        if let Some(tier) = self.memory_tier(kind) {
            if self.fits_in_memory(kind, bytes.len()) {
                let len = bytes.len() as u64;
                tier.set(key, MediaBytes::from(bytes.as_slice()), len);
            } else {
                tier.remove(key);
                debug!(key = %key, bytes = bytes.len(), kind = ?kind, "Too large for memory tier");
            }
        }

        self.disk.store(&disk_key, bytes, kind.ttl(&self.settings)).await?;
        self.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Look up `key`: memory, then disk, else `None`
    pub async fn retrieve(&self, kind: MediaKind, key: &str) -> Option<MediaBytes> {
        let timer = OperationTimer::start();
        let result = self.lookup(kind, key).await;
        self.monitor.record_latency(timer.elapsed());
        result
    }

    async fn lookup(&self, kind: MediaKind, key: &str) -> Option<MediaBytes> {
        if let Some(tier) = self.memory_tier(kind) {
            if let Some(bytes) = tier.get(key) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(bytes);
            }
        }

        let Some(stored) = self.disk.retrieve(&kind.disk_key(key)).await else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let bytes = if kind == MediaKind::Compressed {
            match gunzip(&stored) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(key = %key, error = %err, "Corrupt compressed entry");
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        } else {
            stored
        };

        self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        let bytes = MediaBytes::from(bytes);
        if let Some(tier) = self.memory_tier(kind) {
            if self.fits_in_memory(kind, bytes.len()) {
                tier.set(key, bytes.clone(), bytes.len() as u64);
            }
        }
        Some(bytes)
    }

    pub async fn retrieve_image(&self, key: &str) -> Option<MediaBytes> {
        self.retrieve(MediaKind::Image, key).await
    }

    pub async fn retrieve_audio(&self, key: &str) -> Option<MediaBytes> {
        self.retrieve(MediaKind::Audio, key).await
    }

    pub async fn retrieve_thumbnail(&self, key: &str) -> Option<MediaBytes> {
        self.retrieve(MediaKind::Thumbnail, key).await
    }

    pub async fn retrieve_compressed(&self, key: &str) -> Option<MediaBytes> {
        self.retrieve(MediaKind::Compressed, key).await
    }

    /// Whether `key` is resident in the memory tier for `kind`
    pub fn is_in_memory(&self, kind: MediaKind, key: &str) -> bool {
        self.memory_tier(kind)
            .map(|tier| tier.contains(key))
            .unwrap_or(false)
    }

    /// Remove `key` of `kind` from memory and disk
    pub async fn remove(&self, kind: MediaKind, key: &str) -> Result<()> {
        if let Some(tier) = self.memory_tier(kind) {
            tier.remove(key);
        }
        self.disk.remove(&kind.disk_key(key)).await
    }

    /// Start background fetches for `keys`
    ///
    /// Keys already in memory or already being preloaded are skipped. Returns the
    /// number of tasks started.
    pub fn preload(
        self: &Arc<Self>,
        keys: &[String],
        kind: MediaKind,
        priority: PreloadPriority,
        source: Arc<dyn MediaSource>,
    ) -> usize {
        let mut preloads = self.preloads.lock();
        let mut started = 0;
        for key in keys {
            if self.is_in_memory(kind, key) || preloads.contains_key(key) {
                continue;
            }

            let id = self.next_preload_id.fetch_add(1, Ordering::Relaxed);
            let cache = Arc::downgrade(self);
            let source = source.clone();
            let task_key = key.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(priority.start_delay()).await;
                if let Some(cache) = cache.upgrade() {
                    cache.run_preload(kind, &task_key, source.as_ref()).await;
                    cache.finish_preload(&task_key, id);
                }
            });
            preloads.insert(key.clone(), PreloadTask { id, handle });
            started += 1;
        }
        if started > 0 {
            debug!(started, kind = ?kind, priority = ?priority, "Started preloads");
        }
        started
    }

    async fn run_preload(&self, kind: MediaKind, key: &str, source: &dyn MediaSource) {
        if self.is_in_memory(kind, key) {
            return;
        }
        if self.lookup(kind, key).await.is_some() {
            return;
        }
        let Some(bytes) = source.load(kind, key).await else {
            debug!(key = %key, "Preload source had nothing");
            return;
        };

        let stored = match kind {
            MediaKind::Image => self.store_image(&bytes, key).await,
            MediaKind::Compressed => self.store_compressed(&bytes, key).await,
            _ => self.store(kind, bytes, key).await,
        };
        if let Err(err) = stored {
            warn!(key = %key, error = %err, "Preload failed");
        }
    }

    fn finish_preload(&self, key: &str, id: u64) {
        let mut preloads = self.preloads.lock();
        if preloads.get(key).map(|task| task.id) == Some(id) {
            preloads.remove(key);
        }
    }

    /// Cancel the preload for `key`; returns whether one was running
    pub fn cancel_preload(&self, key: &str) -> bool {
        match self.preloads.lock().remove(key) {
            Some(task) => {
                task.handle.abort();
                self.counters
                    .cancelled_preloads
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cancel every running preload; returns how many were cancelled
    pub fn cancel_all_preloads(&self) -> usize {
        let tasks: Vec<PreloadTask> = self.preloads.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.handle.abort();
        }
        self.counters
            .cancelled_preloads
            .fetch_add(tasks.len() as u64, Ordering::Relaxed);
        tasks.len()
    }

    pub fn active_preloads(&self) -> usize {
        self.preloads.lock().len()
    }

    /// Record that `key` depends on `depends_on`
    pub fn register_dependency(&self, key: &str, depends_on: &str) {
        self.graph.write().add_edge(key, depends_on);
    }

    /// Invalidate `key` and every key that transitively depends on it
    ///
    /// Memory, disk and in-flight preloads are all cleared. Returns the keys removed.
    pub async fn invalidate_cascade(&self, key: &str) -> Vec<String> {
        let keys = {
            let mut graph = self.graph.write();
            let mut keys = vec![key.to_string()];
            keys.extend(graph.cascade(key));
            for affected in &keys {
                graph.remove(affected);
            }
            keys
        };

        for affected in &keys {
            self.cancel_preload(affected);
            for kind in MediaKind::ALL {
                if let Some(tier) = self.memory_tier(kind) {
                    tier.remove(affected);
                }
                if let Err(err) = self.disk.remove(&kind.disk_key(affected)).await {
                    debug!(key = %affected, error = %err, "Skipping disk invalidation");
                }
            }
        }
        debug!(key = %key, removed = keys.len(), "Media cascade invalidation");
        keys
    }

    /// Drop every memory tier and cancel preloads
    pub fn handle_memory_warning(&self) {
        self.images.clear();
        self.audio.clear();
        self.thumbnails.clear();
        let cancelled = self.cancel_all_preloads();
        self.counters.memory_warnings.fetch_add(1, Ordering::Relaxed);
        info!(cancelled, "Memory warning: cleared media memory tiers");
    }

    /// React to memory-pressure notifications until the channel closes
    pub fn attach_memory_pressure(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<MemoryPressure>,
    ) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        match cache.upgrade() {
                            Some(cache) => cache.handle_memory_warning(),
                            None => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Clear memory, disk, preloads and the dependency graph
    pub async fn clear_all(&self) {
        self.images.clear();
        self.audio.clear();
        self.thumbnails.clear();
        self.cancel_all_preloads();
        self.graph.write().clear();
        self.disk.clear().await;
    }

    /// Sweep expired entries from disk
    pub async fn cleanup_expired(&self) -> usize {
        self.disk.cleanup_expired().await
    }

    pub fn disk(&self) -> &DiskBackedStore {
        &self.disk
    }

    pub fn stats(&self) -> MediaCacheStats {
        MediaCacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
            memory_warnings: self.counters.memory_warnings.load(Ordering::Relaxed),
            cancelled_preloads: self.counters.cancelled_preloads.load(Ordering::Relaxed),
            active_preloads: self.active_preloads(),
            image_count: self.images.current_count(),
            image_bytes: self.images.current_cost(),
            audio_count: self.audio.current_count(),
            audio_bytes: self.audio.current_cost(),
            thumbnail_count: self.thumbnails.current_count(),
            thumbnail_bytes: self.thumbnails.current_cost(),
        }
    }
}

impl Drop for TieredMediaCache {
    fn drop(&mut self) {
        for (_, task) in self.preloads.get_mut().drain() {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capacity::{AdaptiveCapacityPlanner, DeviceMemoryTier},
        compression::tests::png_bytes,
        config::DiskSettings,
    };
    use std::path::Path;
    use tempfile::tempdir;

    fn media_cache(dir: &Path) -> Arc<TieredMediaCache> {
        let monitor = Arc::new(PerformanceMonitor::default());
        let plan = AdaptiveCapacityPlanner::plan_for_tier(DeviceMemoryTier::Standard);
        let disk = DiskBackedStore::open(
            dir.join("media"),
            plan.media_disk_budget_bytes,
            &DiskSettings::default(),
            monitor.clone(),
        );
        Arc::new(TieredMediaCache::new(
            MediaSettings::default(),
            &plan,
            disk,
            monitor,
        ))
    }

    struct StaticSource {
        delay: Duration,
    }

    #[async_trait]
    impl MediaSource for StaticSource {
        async fn load(&self, _kind: MediaKind, key: &str) -> Option<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            if key.starts_with("missing") {
                None
            } else {
                Some(format!("audio:{}", key).into_bytes())
            }
        }
    }

    async fn wait_for_preloads(cache: &TieredMediaCache) {
        for _ in 0..100 {
            if cache.active_preloads() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("preloads did not finish");
    }

    #[tokio::test]
    async fn test_audio_memory_hit() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());

        cache.store_audio(b"clip".to_vec(), "card_1").await.unwrap();

        assert_eq!(cache.retrieve_audio("card_1").await.as_deref(), Some(&b"clip"[..]));
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_disk_hit_repopulates_memory() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());

        cache.store_audio(b"clip".to_vec(), "card_1").await.unwrap();
        cache.handle_memory_warning();
        assert!(!cache.is_in_memory(MediaKind::Audio, "card_1"));

        assert!(cache.retrieve_audio("card_1").await.is_some());
        assert!(cache.is_in_memory(MediaKind::Audio, "card_1"));

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_warnings, 1);
    }

    #[tokio::test]
    async fn test_large_audio_skips_memory() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());
        let large = vec![7u8; 3 * 1024 * 1024];

        cache.store_audio(large, "lecture").await.unwrap();

        assert!(!cache.is_in_memory(MediaKind::Audio, "lecture"));
        let retrieved = cache.retrieve_audio("lecture").await.unwrap();
        assert_eq!(retrieved.len(), 3 * 1024 * 1024);
        assert!(!cache.is_in_memory(MediaKind::Audio, "lecture"));
    }

    #[tokio::test]
    async fn test_image_is_recompressed() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());

        cache.store_image(&png_bytes(80, 60), "front").await.unwrap();

        let stored = cache.retrieve_image("front").await.unwrap();
        assert_eq!(
            image::guess_format(&stored).unwrap(),
            image::ImageFormat::Jpeg
        );
        assert!(cache.store_image(b"garbage", "broken").await.is_err());
    }

    #[tokio::test]
    async fn test_thumbnail_and_compressed_blob() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());

        cache.store_thumbnail(&png_bytes(300, 300), "deck_cover").await.unwrap();
        assert!(cache.is_in_memory(MediaKind::Thumbnail, "deck_cover"));

        let payload = b"export ".repeat(100);
        cache.store_compressed(&payload, "log").await.unwrap();
        let restored = cache.retrieve_compressed("log").await.unwrap();
        assert_eq!(&restored[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_miss() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());

        assert!(cache.retrieve_image("nothing").await.is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_preload_populates_memory() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());
        let source = Arc::new(StaticSource {
            delay: Duration::ZERO,
        });
        let keys = vec!["a".to_string(), "b".to_string(), "missing_c".to_string()];

        let started = cache.preload(&keys, MediaKind::Audio, PreloadPriority::High, source);
        assert_eq!(started, 3);
        wait_for_preloads(&cache).await;

        assert!(cache.is_in_memory(MediaKind::Audio, "a"));
        assert!(cache.is_in_memory(MediaKind::Audio, "b"));
        assert!(!cache.is_in_memory(MediaKind::Audio, "missing_c"));
    }

    #[tokio::test]
    async fn test_preload_of_cached_key_is_noop() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());
        cache.store_audio(b"clip".to_vec(), "a").await.unwrap();

        let source = Arc::new(StaticSource {
            delay: Duration::ZERO,
        });
        let started = cache.preload(
            &["a".to_string()],
            MediaKind::Audio,
            PreloadPriority::High,
            source,
        );
        assert_eq!(started, 0);
    }

    #[tokio::test]
    async fn test_cancel_preloads() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());
        let source = Arc::new(StaticSource {
            delay: Duration::from_secs(30),
        });
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        cache.preload(&keys, MediaKind::Audio, PreloadPriority::Background, source);

        assert!(cache.cancel_preload("a"));
        assert!(!cache.cancel_preload("a"));
        assert_eq!(cache.active_preloads(), 2);

        cache.handle_memory_warning();
        assert_eq!(cache.active_preloads(), 0);
        assert_eq!(cache.stats().cancelled_preloads, 3);
    }

    #[tokio::test]
    async fn test_invalidate_cascade() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());
        cache.store_audio(b"deck".to_vec(), "deck_1").await.unwrap();
        cache.store_audio(b"card".to_vec(), "card_1").await.unwrap();
        cache.store_audio(b"side".to_vec(), "card_1_back").await.unwrap();
        cache.store_audio(b"other".to_vec(), "card_2").await.unwrap();
        cache.register_dependency("card_1", "deck_1");
        cache.register_dependency("card_1_back", "card_1");

        let mut removed = cache.invalidate_cascade("deck_1").await;
        removed.sort();
        assert_eq!(removed, vec!["card_1", "card_1_back", "deck_1"]);

        assert!(cache.retrieve_audio("card_1").await.is_none());
        assert!(cache.retrieve_audio("card_1_back").await.is_none());
        assert!(cache.retrieve_audio("deck_1").await.is_none());
        assert!(cache.retrieve_audio("card_2").await.is_some());
    }

    #[tokio::test]
    async fn test_memory_pressure_listener() {
        let dir = tempdir().unwrap();
        let cache = media_cache(dir.path());
        cache.store_audio(b"clip".to_vec(), "a").await.unwrap();

        let (sender, receiver) = broadcast::channel(4);
        let listener = cache.attach_memory_pressure(receiver);
        sender.send(MemoryPressure::Critical).unwrap();
        drop(sender);
        listener.await.unwrap();

        assert!(!cache.is_in_memory(MediaKind::Audio, "a"));
        assert_eq!(cache.stats().memory_warnings, 1);
    }
}
