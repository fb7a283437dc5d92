//! CPU information collection.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// CPU identity of the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Vendor id (e.g. "GenuineIntel")
    pub vendor: String,
    /// CPU model name
    pub model: String,
    /// Number of physical cores
    pub physical_cores: usize,
    /// Number of logical cores (threads)
    pub logical_cores: usize,
    /// CPU frequency in MHz
    pub frequency_mhz: u64,
    /// Feature flags as reported by the kernel
    pub flags: Vec<String>,
}

/// Collect CPU information from the system.
pub fn collect_cpu_info(system: &System) -> CpuInfo {
    let cpus = system.cpus();

    let model = cpus.first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    let vendor = cpus.first()
        .map(|cpu| cpu.vendor_id().to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    let frequency_mhz = cpus.first()
        .map(|cpu| cpu.frequency())
        .unwrap_or(0);

    CpuInfo {
        vendor,
        model,
        physical_cores: system.physical_core_count().unwrap_or(0),
        logical_cores: cpus.len(),
        frequency_mhz,
        flags: read_cpu_flags(),
    }
}

/// Read the feature flags of the first CPU from /proc/cpuinfo.
fn read_cpu_flags() -> Vec<String> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/cpuinfo") {
            return parse_flags(&content);
        }
    }

    Vec::new()
}

/// Extract the `flags` line of the first processor block.
fn parse_flags(cpuinfo: &str) -> Vec<String> {
    cpuinfo
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "flags").then(|| {
                value.split_whitespace().map(str::to_string).collect::<Vec<_>>()
            })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_takes_first_block() {
        let cpuinfo = "processor\t: 0\nflags\t\t: fpu vme sse2\n\nprocessor\t: 1\nflags\t\t: fpu\n";
        assert_eq!(parse_flags(cpuinfo), vec!["fpu", "vme", "sse2"]);
    }

    #[test]
    fn test_parse_flags_missing() {
        assert!(parse_flags("processor\t: 0\n").is_empty());
    }
}
