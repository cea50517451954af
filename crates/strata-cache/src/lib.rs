//! # Strata Cache
//!
//! Multi-tier caching for a study application: derived values, review scheduling data
//! and media, kept in memory with an asynchronous disk tier behind them.
//!
//! ## Features
//!
//! - **Bounded memory tiers**: LRU eviction by entry count and byte cost
//! - **Dependency invalidation**: TTL entries removed transitively when a source record changes
//! - **Disk tier**: per-directory worker with expiry metadata, byte budgets and backpressure
//! - **Media cache**: images, audio, thumbnails and compressed blobs with preloading
//! - **Adaptive capacity**: tier limits chosen from device memory
//! - **Performance monitoring**: hit rates, latency, alerts and health
//! - **Memory pressure**: broadcast notifications that release memory tiers

pub mod averages;
pub mod bounded;
pub mod capacity;
pub mod compression;
pub mod config;
pub mod dependency;
pub mod disk;
pub mod error;
pub mod graph;
pub mod manager;
pub mod media;
pub mod monitor;
pub mod pressure;
pub mod records;
pub mod review;
pub mod services;
pub mod telemetry;

pub use averages::AverageCache;
pub use bounded::BoundedObjectCache;
pub use capacity::{AdaptiveCapacityPlanner, CapacityPlan, CapacityProfile, DeviceMemoryTier};
pub use crate::config::CacheSettings;
pub use dependency::{dependency_set, CacheEntry, DependencyCache};
pub use disk::{CleanupReport, DiskBackedStore};
pub use error::{CacheError, Result};
pub use graph::DependencyGraph;
pub use manager::{HierarchicalCacheManager, ManagerStats};
pub use media::{MediaKind, MediaSource, PreloadPriority, TieredMediaCache};
pub use monitor::{HealthStatus, PerformanceMonitor, PerformanceSnapshot};
pub use pressure::{MemoryPressure, MemoryPressureNotifier, MemoryPressureWatcher};
pub use records::{CardRecord, CardUpdate, RecordQuery, RecordStore, ReviewOutcome};
pub use review::{DeckStats, ReviewCache};
pub use services::CacheServices;
