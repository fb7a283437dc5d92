//! Host identity.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Who the host is, as logged when the daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    /// Distribution name, e.g. "Ubuntu"
    pub os_name: String,
    pub os_version: Option<String>,
    pub kernel_version: String,
    pub uptime_seconds: u64,
}

impl SystemInfo {
    /// One-line description such as `Ubuntu 22.04 (kernel 6.5.0)`.
    pub fn os_description(&self) -> String {
        match &self.os_version {
            Some(version) => format!("{} {} (kernel {})", self.os_name, version, self.kernel_version),
            None => format!("{} (kernel {})", self.os_name, self.kernel_version),
        }
    }
}

fn or_unknown(value: Option<String>) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn collect_system_info() -> SystemInfo {
    SystemInfo {
        hostname: or_unknown(System::host_name()),
        os_name: or_unknown(System::name()),
        os_version: System::os_version(),
        kernel_version: or_unknown(System::kernel_version()),
        uptime_seconds: System::uptime(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_description() {
        let mut info = SystemInfo {
            hostname: "node-1".into(),
            os_name: "Debian".into(),
            os_version: Some("12".into()),
            kernel_version: "6.1.0".into(),
            uptime_seconds: 10,
        };
        assert_eq!(info.os_description(), "Debian 12 (kernel 6.1.0)");

        info.os_version = None;
        assert_eq!(info.os_description(), "Debian (kernel 6.1.0)");
        assert_eq!(or_unknown(Some("  ".into())), "unknown");
    }
}
