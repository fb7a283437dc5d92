//! # vmplane Telemetry
//!
//! Host discovery for the node daemon: CPU identity and flags, physical
//! memory and basic OS information. Used to describe the host when the
//! daemon runs without a real hypervisor connection and to log the host
//! profile at startup.

pub mod cpu;
pub mod memory;
pub mod system;

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, trace};

pub use cpu::CpuInfo;
pub use memory::MemoryInfo;
pub use system::SystemInfo;

/// Complete host snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostTelemetry {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub system: SystemInfo,
}

/// Collects host information on demand.
pub struct TelemetryCollector {
    system: Mutex<System>,
}

impl TelemetryCollector {
    /// Create a new collector with an initial CPU and memory refresh.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_specifics(Self::refresh_kind());

        debug!("TelemetryCollector initialized");

        Self {
            system: Mutex::new(system),
        }
    }

    fn refresh_kind() -> RefreshKind {
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything())
    }

    /// Refresh and collect a host snapshot.
    pub fn collect(&self) -> HostTelemetry {
        let started = Instant::now();

        // A poisoned lock only means another collector call panicked
        // mid-refresh; the System value itself is still usable.
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_specifics(Self::refresh_kind());

        let snapshot = HostTelemetry {
            cpu: cpu::collect_cpu_info(&system),
            memory: memory::collect_memory_info(&system),
            system: system::collect_system_info(),
        };

        trace!(duration_ms = started.elapsed().as_millis(), "Host telemetry collected");
        snapshot
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_memory() {
        let collector = TelemetryCollector::new();
        let snapshot = collector.collect();

        assert!(snapshot.memory.free_bytes <= snapshot.memory.total_bytes);
        assert!(!snapshot.system.hostname.is_empty());
    }
}
