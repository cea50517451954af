//! Device-aware capacity planning
//!
//! Capacity is decided once per process from the amount of physical memory. Every memory
//! tier gets a [`CapacityProfile`] with an entry-count limit and a byte-cost limit.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Count and cost limits for one memory tier
///
/// A limit of `0` disables that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityProfile {
    /// Maximum number of entries
    pub count_limit: usize,
    /// Maximum cumulative cost in bytes
    pub cost_limit_bytes: u64,
}

impl CapacityProfile {
    pub const fn new(count_limit: usize, cost_limit_bytes: u64) -> Self {
        Self {
            count_limit,
            cost_limit_bytes,
        }
    }

    /// Profile with no limits at all
    pub const fn unbounded() -> Self {
        Self::new(0, 0)
    }

    pub fn exceeds_count(&self, count: usize) -> bool {
        self.count_limit != 0 && count > self.count_limit
    }

    pub fn exceeds_cost(&self, cost: u64) -> bool {
        self.cost_limit_bytes != 0 && cost > self.cost_limit_bytes
    }
}

/// Device memory class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMemoryTier {
    /// Up to 2 GB
    Compact,
    /// 3 to 4 GB
    Standard,
    /// 5 to 8 GB
    Performance,
    /// More than 8 GB
    HighEnd,
}

impl DeviceMemoryTier {
    /// Classify a device by its physical memory, counted in whole gigabytes
    pub fn from_memory_bytes(memory_bytes: u64) -> Self {
        match memory_bytes / GB {
            0..=2 => DeviceMemoryTier::Compact,
            3..=4 => DeviceMemoryTier::Standard,
            5..=8 => DeviceMemoryTier::Performance,
            _ => DeviceMemoryTier::HighEnd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMemoryTier::Compact => "compact",
            DeviceMemoryTier::Standard => "standard",
            DeviceMemoryTier::Performance => "performance",
            DeviceMemoryTier::HighEnd => "high_end",
        }
    }
}

/// Memory tiers that receive an adaptive profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Objects,
    Images,
    Audio,
    Thumbnails,
}

/// Full capacity plan for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub tier: DeviceMemoryTier,
    pub objects: CapacityProfile,
    pub images: CapacityProfile,
    pub audio: CapacityProfile,
    pub thumbnails: CapacityProfile,
    /// Byte budget of the media disk directory
    pub media_disk_budget_bytes: u64,
}

impl CapacityPlan {
    pub fn profile(&self, tier: CacheTier) -> CapacityProfile {
        match tier {
            CacheTier::Objects => self.objects,
            CacheTier::Images => self.images,
            CacheTier::Audio => self.audio,
            CacheTier::Thumbnails => self.thumbnails,
        }
    }
}

/// Maps device memory to capacity profiles
///
/// The numbers are hand-tuned for a working set of a few hundred to a couple of
/// thousand small records.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveCapacityPlanner;

impl AdaptiveCapacityPlanner {
    /// Plan capacity for a device with `memory_bytes` of physical memory
    pub fn plan_for(memory_bytes: u64) -> CapacityPlan {
        Self::plan_for_tier(DeviceMemoryTier::from_memory_bytes(memory_bytes))
    }

    /// Plan capacity for an explicit memory tier
    pub fn plan_for_tier(tier: DeviceMemoryTier) -> CapacityPlan {
        match tier {
            DeviceMemoryTier::Compact => CapacityPlan {
                tier,
                objects: CapacityProfile::new(30, 3 * MB),
                images: CapacityProfile::new(15, 30 * MB),
                audio: CapacityProfile::new(5, 15 * MB),
                thumbnails: CapacityProfile::new(30, 10 * MB),
                media_disk_budget_bytes: 150 * MB,
            },
            DeviceMemoryTier::Standard => CapacityPlan {
                tier,
                objects: CapacityProfile::new(100, 15 * MB),
                images: CapacityProfile::new(50, 100 * MB),
                audio: CapacityProfile::new(20, 50 * MB),
                thumbnails: CapacityProfile::new(100, 40 * MB),
                media_disk_budget_bytes: 500 * MB,
            },
            DeviceMemoryTier::Performance => CapacityPlan {
                tier,
                objects: CapacityProfile::new(200, 30 * MB),
                images: CapacityProfile::new(100, 200 * MB),
                audio: CapacityProfile::new(40, 100 * MB),
                thumbnails: CapacityProfile::new(200, 80 * MB),
                media_disk_budget_bytes: GB,
            },
            DeviceMemoryTier::HighEnd => CapacityPlan {
                tier,
                objects: CapacityProfile::new(500, 50 * MB),
                images: CapacityProfile::new(200, 400 * MB),
                audio: CapacityProfile::new(80, 200 * MB),
                thumbnails: CapacityProfile::new(400, 160 * MB),
                media_disk_budget_bytes: 2 * GB,
            },
        }
    }

    /// Plan capacity for the current machine
    pub fn plan_for_device() -> CapacityPlan {
        let memory_bytes = detect_memory_bytes();
        let plan = Self::plan_for(memory_bytes);
        debug!(
            memory_bytes,
            tier = plan.tier.as_str(),
            object_count = plan.objects.count_limit,
            "Planned cache capacity"
        );
        plan
    }
}

/// Total physical memory of the machine in bytes
pub fn detect_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}
