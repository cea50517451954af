//! Cache configuration
//!
//! All tuning constants live here. They were picked by hand for small record sets and
//! are meant to be adjusted per deployment through a TOML file or `STRATA_CACHE__*`
//! environment variables.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    capacity::{CapacityProfile, DeviceMemoryTier},
    error::{CacheError, Result},
};

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "STRATA_CACHE";

/// Root configuration for the cache subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl: TtlPolicy,
    pub media: MediaSettings,
    pub disk: DiskSettings,
    pub manager: ManagerSettings,
    pub monitor: MonitorSettings,
    pub review: ReviewSettings,
    pub pressure: PressureSettings,
    /// Skip device detection and use this memory tier
    pub memory_tier_override: Option<DeviceMemoryTier>,
}

impl CacheSettings {
    /// Load settings from an optional TOML file layered with environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref().to_path_buf()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let settings: CacheSettings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from [`CacheSettings::default_path`]
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// `<config dir>/strata/cache.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("cache.toml")
    }

    /// Default location of the on-disk cache directories
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("strata")
    }

    /// Reject values that would make the caches misbehave
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.disk.cleanup_ratio) {
            return Err(CacheError::Config {
                message: format!(
                    "disk.cleanup_ratio must be within 0.0..=1.0, got {}",
                    self.disk.cleanup_ratio
                ),
            });
        }
        if self.disk.queue_capacity == 0 {
            return Err(CacheError::Config {
                message: "disk.queue_capacity must be at least 1".to_string(),
            });
        }
        if self.monitor.hit_rate_sample_interval == 0 {
            return Err(CacheError::Config {
                message: "monitor.hit_rate_sample_interval must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Time-to-live per class of derived value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    pub averages_secs: u64,
    pub card_selections_secs: u64,
    pub deck_stats_secs: u64,
    pub review_results_secs: u64,
}

impl TtlPolicy {
    pub fn averages(&self) -> Duration {
        Duration::from_secs(self.averages_secs)
    }

    pub fn card_selections(&self) -> Duration {
        Duration::from_secs(self.card_selections_secs)
    }

    pub fn deck_stats(&self) -> Duration {
        Duration::from_secs(self.deck_stats_secs)
    }

    pub fn review_results(&self) -> Duration {
        Duration::from_secs(self.review_results_secs)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            averages_secs: 300,
            card_selections_secs: 120,
            deck_stats_secs: 60,
            review_results_secs: 300,
        }
    }
}

/// Media cache policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub image_ttl_days: u64,
    pub audio_ttl_days: u64,
    pub thumbnail_ttl_days: u64,
    pub compressed_ttl_days: u64,
    /// Images at or above this size skip the memory tier
    pub image_memory_threshold_bytes: u64,
    /// Audio clips at or above this size skip the memory tier
    pub audio_memory_threshold_bytes: u64,
    pub max_image_dimension: u32,
    /// Pixel count above which the lower JPEG quality applies
    pub large_image_pixels: u64,
    pub jpeg_quality: u8,
    pub large_image_jpeg_quality: u8,
    pub thumbnail_dimension: u32,
    pub thumbnail_max_bytes: u64,
}

impl MediaSettings {
    pub fn ttl_days(days: u64) -> Duration {
        Duration::from_secs(days * DAY_SECS)
    }
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            image_ttl_days: 30,
            audio_ttl_days: 7,
            thumbnail_ttl_days: 60,
            compressed_ttl_days: 14,
            image_memory_threshold_bytes: 3 * MB / 2,
            audio_memory_threshold_bytes: 2 * MB,
            max_image_dimension: 1200,
            large_image_pixels: 500_000,
            jpeg_quality: 70,
            large_image_jpeg_quality: 50,
            thumbnail_dimension: 150,
            thumbnail_max_bytes: 50 * 1024,
        }
    }
}

/// Disk tier behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSettings {
    /// Cleanup shrinks the directory to `budget * cleanup_ratio`
    pub cleanup_ratio: f64,
    /// Pending commands per directory before writers wait
    pub queue_capacity: usize,
    /// How long a write waits for queue space before it is dropped
    pub enqueue_timeout_ms: u64,
}

impl DiskSettings {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            cleanup_ratio: 0.7,
            queue_capacity: 256,
            enqueue_timeout_ms: 250,
        }
    }
}

/// Hierarchical cache manager policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub disk_budget_bytes: u64,
    pub value_cache: CapacityProfile,
    pub asset_cache: CapacityProfile,
    /// Keys reloaded at startup and persisted before evictions
    pub critical_keys: Vec<String>,
    /// Values whose key contains one of these fragments are written through to disk
    pub persistent_patterns: Vec<String>,
    /// TTL given to values written to disk
    pub persisted_ttl_days: u64,
}

impl ManagerSettings {
    pub fn persisted_ttl(&self) -> Duration {
        Duration::from_secs(self.persisted_ttl_days * DAY_SECS)
    }

    pub fn is_persistent(&self, key: &str) -> bool {
        self.persistent_patterns
            .iter()
            .any(|pattern| key.contains(pattern.as_str()))
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            disk_budget_bytes: 100 * MB,
            value_cache: CapacityProfile::new(200, 2 * MB),
            asset_cache: CapacityProfile::new(100, 10 * MB),
            critical_keys: vec![
                "current_semester_average".to_string(),
                "overall_average".to_string(),
                "subject_averages".to_string(),
            ],
            persistent_patterns: vec!["average".to_string(), "grade".to_string()],
            persisted_ttl_days: 30,
        }
    }
}

/// Performance monitor thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub history_len: usize,
    pub hit_rate_sample_interval: u64,
    pub slow_request_ms: f64,
    pub warning_hit_rate: f64,
    pub critical_hit_rate: f64,
    pub alert_latency_ms: f64,
    pub alert_eviction_rate: f64,
    pub calculation_threshold_ms: f64,
    pub selection_threshold_ms: f64,
    pub stats_threshold_ms: f64,
    pub batch_threshold_ms: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            history_len: 100,
            hit_rate_sample_interval: 50,
            slow_request_ms: 100.0,
            warning_hit_rate: 70.0,
            critical_hit_rate: 50.0,
            alert_latency_ms: 200.0,
            alert_eviction_rate: 20.0,
            calculation_threshold_ms: 50.0,
            selection_threshold_ms: 100.0,
            stats_threshold_ms: 200.0,
            batch_threshold_ms: 500.0,
        }
    }
}

/// Review-scheduling cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    pub result_cache: CapacityProfile,
    pub selection_cache: CapacityProfile,
    pub stats_cache: CapacityProfile,
    pub average_cache: CapacityProfile,
    /// A card whose interval reaches this many days counts as mastered
    pub mastery_interval_days: f64,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            result_cache: CapacityProfile::new(100, 5 * MB),
            selection_cache: CapacityProfile::new(50, 2 * MB),
            stats_cache: CapacityProfile::new(20, MB),
            average_cache: CapacityProfile::new(100, MB),
            mastery_interval_days: 21.0,
        }
    }
}

/// Memory pressure watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureSettings {
    pub poll_interval_secs: u64,
    /// Notify when available memory drops below this fraction of total memory
    pub low_memory_fraction: f64,
}

impl PressureSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            low_memory_fraction: 0.1,
        }
    }
}
