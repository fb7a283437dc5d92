//! Core hypervisor abstraction trait.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::*;

/// Capabilities supported by a hypervisor backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorCapabilities {
    /// Name of the backend (e.g., "xen", "mock")
    pub name: String,
    /// Version string
    pub version: String,
    /// Supports live migration
    pub supports_live_migration: bool,
    /// Supports hot-plug of devices
    pub supports_hotplug: bool,
    /// Supports PCI passthrough
    pub supports_pci_passthrough: bool,
    /// Supports hardware virtualized guests
    pub supports_hvm: bool,
    /// Maximum vCPUs per domain
    pub max_vcpus: u32,
}

/// Core hypervisor abstraction trait.
///
/// The control plane drives domains exclusively through this trait. Every
/// call is treated as fallible and possibly slow; callers serialize calls
/// that target the same domain.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Capabilities & Host
    // =========================================================================

    /// Get hypervisor capabilities.
    async fn capabilities(&self) -> Result<HypervisorCapabilities>;

    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    /// Describe the host CPUs.
    async fn host_cpu(&self) -> Result<HostCpuInfo>;

    /// Total host memory in MiB.
    async fn total_memory_mib(&self) -> Result<u64>;

    /// Memory in MiB not claimed by any domain.
    async fn free_memory_mib(&self) -> Result<u64>;

    /// Contents of the hypervisor console ring.
    async fn console_data(&self) -> Result<String>;

    /// Subscribe to unattended domain events.
    fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent>;

    // =========================================================================
    // Domain Lifecycle
    // =========================================================================

    /// Create an empty, paused domain for the VM and return its id.
    async fn create_domain(&self, config: &VmConfig) -> Result<DomId>;

    /// Load the guest kernel or firmware into the domain.
    ///
    /// `boot_disk` is the attached path of the disk the bootloader should
    /// read, for bootloader-mediated PV guests.
    async fn build_domain(&self, domid: DomId, config: &VmConfig, boot_disk: Option<&str>) -> Result<()>;

    /// Start the device model (emulator) for a built domain.
    ///
    /// `restore` is set when the domain is being resumed from a suspend image.
    /// Returns the consoles the domain exposes.
    async fn create_device_model(&self, domid: DomId, config: &VmConfig, restore: bool) -> Result<Vec<Console>>;

    /// Tear down a domain immediately.
    async fn destroy_domain(&self, domid: DomId) -> Result<()>;

    /// Pause a domain (freeze execution).
    async fn pause_domain(&self, domid: DomId) -> Result<()>;

    /// Unpause a domain.
    async fn unpause_domain(&self, domid: DomId) -> Result<()>;

    /// Ask the guest to halt or reboot and wait up to `timeout` for it to
    /// acknowledge.
    ///
    /// Returns `ShutdownTimeout` if the guest does not comply in time.
    async fn shutdown_domain(&self, domid: DomId, reason: ShutdownReason, timeout: Duration) -> Result<()>;

    /// Save the domain's memory image to `path`. The domain is gone afterwards.
    async fn suspend_domain(&self, domid: DomId, path: &str) -> Result<()>;

    /// Load a memory image from `path` into a freshly created domain.
    async fn restore_domain(&self, domid: DomId, config: &VmConfig, path: &str) -> Result<()>;

    /// Send the domain to another host.
    async fn migrate_domain(&self, domid: DomId, destination: &str, options: &MigrateOptions) -> Result<()>;

    /// Write a core dump of the domain to `path`.
    async fn dump_core(&self, domid: DomId, path: &str) -> Result<()>;

    /// Get runtime information about a domain.
    async fn domain_info(&self, domid: DomId) -> Result<DomainInfo>;

    // =========================================================================
    // Runtime Tuning
    // =========================================================================

    /// Set the number of online vCPUs.
    async fn set_vcpus(&self, domid: DomId, count: u32) -> Result<()>;

    /// Set the balloon target range.
    async fn set_memory_target(&self, domid: DomId, min_mib: u64, max_mib: u64) -> Result<()>;

    /// Set the shadow memory multiplier.
    async fn set_shadow_multiplier(&self, domid: DomId, multiplier: f64) -> Result<()>;

    /// Write key/value data into the guest's store.
    async fn write_xsdata(&self, domid: DomId, data: &BTreeMap<String, String>) -> Result<()>;

    // =========================================================================
    // Block Devices
    // =========================================================================

    /// Attach a block device. `path` is the storage-resolved backing path.
    async fn attach_vbd(&self, domid: DomId, vbd: &VbdConfig, path: Option<&str>) -> Result<()>;

    /// Detach a block device. `force` skips the guest handshake.
    async fn detach_vbd(&self, domid: DomId, vbd: &VbdConfig, force: bool) -> Result<()>;

    /// Swap the media in an ejectable drive. `None` ejects.
    async fn change_media(&self, domid: DomId, vbd: &VbdConfig, path: Option<&str>) -> Result<()>;

    // =========================================================================
    // Network Interfaces
    // =========================================================================

    /// Attach a network interface.
    async fn attach_vif(&self, domid: DomId, vif: &VifConfig) -> Result<()>;

    /// Detach a network interface. `force` skips the guest handshake.
    async fn detach_vif(&self, domid: DomId, vif: &VifConfig, force: bool) -> Result<()>;

    /// Raise or drop the link.
    async fn set_carrier(&self, domid: DomId, vif: &VifConfig, carrier: bool) -> Result<()>;

    /// Apply a traffic locking mode.
    async fn set_locking_mode(&self, domid: DomId, vif: &VifConfig, mode: &LockingMode) -> Result<()>;

    /// Reconnect the interface to another backend without unplugging it.
    async fn move_vif(&self, domid: DomId, vif: &VifConfig, backend: &NetworkBackend) -> Result<()>;

    // =========================================================================
    // PCI Passthrough
    // =========================================================================

    /// Pass a host PCI device through to the domain.
    async fn attach_pci(&self, domid: DomId, pci: &PciConfig) -> Result<()>;

    /// Return a PCI device to the host.
    async fn detach_pci(&self, domid: DomId, pci: &PciConfig, force: bool) -> Result<()>;
}
