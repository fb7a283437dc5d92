//! Physical memory of the host.

use serde::{Deserialize, Serialize};
use sysinfo::System;

const MIB: u64 = 1024 * 1024;

/// Host memory, in bytes as sysinfo reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    /// Not in use by anything
    pub free_bytes: u64,
    /// Free plus reclaimable caches
    pub available_bytes: u64,
}

impl MemoryInfo {
    pub fn total_mib(&self) -> u64 {
        self.total_bytes / MIB
    }

    /// What a new domain could be given without squeezing the host.
    pub fn available_mib(&self) -> u64 {
        self.available_bytes / MIB
    }
}

pub fn collect_memory_info(system: &System) -> MemoryInfo {
    MemoryInfo {
        total_bytes: system.total_memory(),
        free_bytes: system.free_memory(),
        available_bytes: system.available_memory(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mib_rounds_down() {
        let info = MemoryInfo {
            total_bytes: 4 * 1024 * MIB + 512,
            free_bytes: 0,
            available_bytes: MIB - 1,
        };
        assert_eq!(info.total_mib(), 4096);
        assert_eq!(info.available_mib(), 0);
    }
}
