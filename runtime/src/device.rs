//! Device capability probing
//!
//! Supplies the memory ceiling and worker-pool size the tile scheduler and
//! job controller size themselves against.

use burst_fusion::MemoryBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTier {
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    pub tier: DeviceTier,
    pub worker_threads: usize,
    /// Per-tile working set ceiling, in bytes.
    pub tile_working_set_bytes: usize,
}

impl DeviceCapabilities {
    /// Probe the host: core count picks the tier, the tier picks the
    /// ceiling.
    pub fn probe() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        let tier = if cores <= 2 {
            DeviceTier::Low
        } else if cores <= 4 {
            DeviceTier::Mid
        } else {
            DeviceTier::High
        };

        Self::for_tier(tier, cores)
    }

    pub fn for_tier(tier: DeviceTier, cores: usize) -> Self {
        let (max_workers, ceiling) = match tier {
            DeviceTier::Low => (2, 48 << 20),
            DeviceTier::Mid => (4, 96 << 20),
            DeviceTier::High => (8, 192 << 20),
        };

        Self {
            tier,
            worker_threads: cores.clamp(1, max_workers),
            tile_working_set_bytes: ceiling,
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        MemoryBudget {
            tile_working_set_bytes: self.tile_working_set_bytes,
            workers: self.worker_threads,
        }
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self::probe()
    }
}
