//! Type definitions for VM and device configuration, and the records the
//! hypervisor reports back.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hypervisor domain identifier.
pub type DomId = u32;

// =============================================================================
// VM CONFIGURATION
// =============================================================================

/// VM configuration (desired state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Boot method, fixed at creation
    pub boot: BootMethod,
    /// Memory bounds
    pub memory: MemoryConfig,
    /// vCPU bounds
    pub vcpus: VcpuConfig,
    /// Scheduler parameters
    #[serde(default)]
    pub scheduler: SchedulerParams,
    /// Action taken when the guest crashes
    #[serde(default = "LifecycleAction::restart")]
    pub on_crash: LifecycleAction,
    /// Action taken when the guest halts itself
    #[serde(default = "LifecycleAction::shutdown")]
    pub on_shutdown: LifecycleAction,
    /// Action taken when the guest reboots itself
    #[serde(default = "LifecycleAction::restart")]
    pub on_reboot: LifecycleAction,
    /// Shadow memory multiplier (HVM only)
    #[serde(default = "default_shadow_multiplier")]
    pub shadow_multiplier: f64,
    /// Key/value data written to the guest's store
    #[serde(default)]
    pub xsdata: BTreeMap<String, String>,
    /// Platform flags passed to the builder (acpi, apic, viridian...)
    #[serde(default)]
    pub platform: BTreeMap<String, String>,
}

fn default_shadow_multiplier() -> f64 {
    1.0
}

impl VmConfig {
    /// Create a configuration with 1 vCPU and 1 GiB of fixed memory.
    pub fn new(id: impl Into<String>, name: impl Into<String>, boot: BootMethod) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            boot,
            memory: MemoryConfig::fixed(1024),
            vcpus: VcpuConfig { max: 1, current: 1 },
            scheduler: SchedulerParams::default(),
            on_crash: LifecycleAction::Restart,
            on_shutdown: LifecycleAction::Shutdown,
            on_reboot: LifecycleAction::Restart,
            shadow_multiplier: default_shadow_multiplier(),
            xsdata: BTreeMap::new(),
            platform: BTreeMap::new(),
        }
    }

    /// Set the memory bounds in MiB.
    pub fn with_memory(mut self, dynamic_min_mib: u64, dynamic_max_mib: u64, static_max_mib: u64) -> Self {
        self.memory = MemoryConfig {
            static_max_mib,
            dynamic_max_mib,
            dynamic_min_mib,
        };
        self
    }

    /// Set the vCPU bounds.
    pub fn with_vcpus(mut self, current: u32, max: u32) -> Self {
        self.vcpus = VcpuConfig { max, current };
        self
    }

    /// Set the crash action.
    pub fn with_on_crash(mut self, action: LifecycleAction) -> Self {
        self.on_crash = action;
        self
    }

    /// Set the guest-initiated shutdown action.
    pub fn with_on_shutdown(mut self, action: LifecycleAction) -> Self {
        self.on_shutdown = action;
        self
    }

    /// Set the guest-initiated reboot action.
    pub fn with_on_reboot(mut self, action: LifecycleAction) -> Self {
        self.on_reboot = action;
        self
    }

    /// Whether the guest is hardware virtualized.
    pub fn is_hvm(&self) -> bool {
        matches!(self.boot, BootMethod::Hvm(_))
    }
}

/// Memory bounds, all in MiB.
///
/// `dynamic_min_mib <= dynamic_max_mib <= static_max_mib` must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub static_max_mib: u64,
    pub dynamic_max_mib: u64,
    pub dynamic_min_mib: u64,
}

impl MemoryConfig {
    /// All three bounds set to the same size.
    pub fn fixed(size_mib: u64) -> Self {
        Self {
            static_max_mib: size_mib,
            dynamic_max_mib: size_mib,
            dynamic_min_mib: size_mib,
        }
    }

    /// Whether the bounds are correctly ordered.
    pub fn is_ordered(&self) -> bool {
        self.dynamic_min_mib <= self.dynamic_max_mib && self.dynamic_max_mib <= self.static_max_mib
    }
}

/// vCPU bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuConfig {
    pub max: u32,
    pub current: u32,
}

/// Credit scheduler parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerParams {
    /// Relative weight
    pub weight: Option<u32>,
    /// Cap as a percentage of one physical CPU
    pub cap: Option<u32>,
    /// Per-vCPU affinity: physical CPUs each vCPU may run on
    #[serde(default)]
    pub affinity: Vec<Vec<u32>>,
}

/// What to do when the guest halts, reboots or crashes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Dump guest memory, then shut down
    Coredump,
    /// Tear the domain down
    Shutdown,
    /// Tear the domain down and start it again
    Restart,
    /// Leave the domain paused for inspection
    Pause,
}

impl LifecycleAction {
    fn restart() -> Self {
        LifecycleAction::Restart
    }

    fn shutdown() -> Self {
        LifecycleAction::Shutdown
    }
}

// =============================================================================
// BOOT METHOD
// =============================================================================

/// How the guest boots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMethod {
    /// Paravirtualized guest
    Pv(PvBoot),
    /// Hardware virtualized guest
    Hvm(HvmBoot),
}

/// Paravirtualized boot flavours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvBoot {
    /// Kernel and ramdisk are taken from the host filesystem.
    Direct {
        kernel: String,
        #[serde(default)]
        cmdline: String,
        ramdisk: Option<String>,
    },
    /// A bootloader extracts the kernel from one of the guest's disks.
    Indirect {
        bootloader: String,
        #[serde(default)]
        extra_args: String,
        #[serde(default)]
        legacy_args: String,
        #[serde(default)]
        bootloader_args: String,
        /// Vbd device ids to try, in order. Empty means "all bootable disks".
        #[serde(default)]
        devices: Vec<String>,
    },
}

/// Hardware virtualized boot parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HvmBoot {
    /// Boot order, e.g. "cd" (disk then cdrom) or "n" (network)
    pub boot_order: String,
    /// Guest firmware
    #[serde(default)]
    pub firmware: Firmware,
    /// RTC offset from host time, in seconds
    #[serde(default)]
    pub timeoffset: String,
    /// Video RAM in MiB
    #[serde(default = "default_video_mib")]
    pub video_mib: u64,
    /// Serial console target (e.g. "pty")
    pub serial: Option<String>,
    /// Expose ACPI tables
    #[serde(default = "default_true")]
    pub acpi: bool,
}

fn default_video_mib() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

impl Default for HvmBoot {
    fn default() -> Self {
        Self {
            boot_order: "cd".to_string(),
            firmware: Firmware::default(),
            timeoffset: "0".to_string(),
            video_mib: default_video_mib(),
            serial: Some("pty".to_string()),
            acpi: true,
        }
    }
}

impl HvmBoot {
    /// Whether the boot order allows network boot.
    pub fn boots_from_network(&self) -> bool {
        self.boot_order.contains('n')
    }
}

/// Guest firmware type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Uefi,
}

// =============================================================================
// CONSOLES
// =============================================================================

/// Console protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleProtocol {
    /// Text console
    Vt100,
    /// VNC
    Rfb,
    /// Remote desktop
    Rdp,
}

/// A console exposed by a running domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Console {
    pub protocol: ConsoleProtocol,
    pub port: u16,
    pub path: String,
}

// =============================================================================
// BLOCK DEVICES
// =============================================================================

/// Reference to a disk, resolved by the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskRef {
    /// Path on the host
    Local(String),
    /// Virtual disk image inside a storage repository
    Vdi { sr: String, vdi: String },
}

impl fmt::Display for DiskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskRef::Local(path) => write!(f, "local:{}", path),
            DiskRef::Vdi { sr, vdi } => write!(f, "vdi:{}/{}", sr, vdi),
        }
    }
}

/// Vbd access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbdMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// Vbd device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VbdType {
    #[default]
    Disk,
    Cdrom,
    Floppy,
}

/// I/O scheduling class for a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoScheduler {
    /// Real-time class with priority 0-7
    RealTime(u8),
    Idle,
    /// Best-effort class with priority 0-7
    BestEffort(u8),
}

/// Disk QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbdQos {
    Ionice(IoScheduler),
}

/// Virtual block device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VbdConfig {
    /// Owning VM
    pub vm: String,
    /// Device id, unique within the VM
    pub id: String,
    /// Guest attachment point (e.g. "xvda", "hdc"), chosen by the backend when unset
    pub position: Option<String>,
    #[serde(default)]
    pub mode: VbdMode,
    #[serde(default)]
    pub ty: VbdType,
    /// Disk behind the device; `None` means an empty drive
    pub backend: Option<DiskRef>,
    /// Whether the device may be hot-unplugged
    #[serde(default = "default_true")]
    pub unpluggable: bool,
    pub qos: Option<VbdQos>,
}

impl VbdConfig {
    /// Create a read-write disk.
    pub fn disk(vm: impl Into<String>, id: impl Into<String>, backend: DiskRef) -> Self {
        Self {
            vm: vm.into(),
            id: id.into(),
            position: None,
            mode: VbdMode::ReadWrite,
            ty: VbdType::Disk,
            backend: Some(backend),
            unpluggable: true,
            qos: None,
        }
    }

    /// Create a read-only CD drive with optional media.
    pub fn cdrom(vm: impl Into<String>, id: impl Into<String>, media: Option<DiskRef>) -> Self {
        Self {
            vm: vm.into(),
            id: id.into(),
            position: None,
            mode: VbdMode::ReadOnly,
            ty: VbdType::Cdrom,
            backend: media,
            unpluggable: true,
            qos: None,
        }
    }

    /// Whether media can be ejected from / inserted into the device.
    pub fn is_ejectable(&self) -> bool {
        matches!(self.ty, VbdType::Cdrom | VbdType::Floppy)
    }
}

// =============================================================================
// NETWORK INTERFACES
// =============================================================================

/// Where a Vif's traffic goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkBackend {
    /// Local bridge
    Bridge(String),
    /// Bridge inside a driver domain
    Remote { vm: String, bridge: String },
}

impl fmt::Display for NetworkBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkBackend::Bridge(name) => write!(f, "{}", name),
            NetworkBackend::Remote { vm, bridge } => write!(f, "{}@{}", bridge, vm),
        }
    }
}

/// Traffic filtering for a Vif.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// All traffic allowed
    #[default]
    Unlocked,
    /// All traffic dropped
    Disabled,
    /// Only traffic from the listed addresses allowed
    Locked {
        #[serde(default)]
        ipv4: Vec<String>,
        #[serde(default)]
        ipv6: Vec<String>,
    },
}

/// Transmit rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub kbytes_per_s: u64,
    pub timeslice_us: u64,
}

/// Virtual network interface configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VifConfig {
    pub vm: String,
    pub id: String,
    /// Device index inside the guest
    pub position: u32,
    pub mac: String,
    #[serde(default = "default_true")]
    pub carrier: bool,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    pub rate: Option<RateLimit>,
    pub backend: NetworkBackend,
    #[serde(default)]
    pub locking_mode: LockingMode,
}

fn default_mtu() -> u32 {
    1500
}

impl VifConfig {
    /// Create an interface on a local bridge.
    pub fn new(vm: impl Into<String>, id: impl Into<String>, position: u32, mac: impl Into<String>, bridge: impl Into<String>) -> Self {
        Self {
            vm: vm.into(),
            id: id.into(),
            position,
            mac: mac.into(),
            carrier: true,
            mtu: default_mtu(),
            rate: None,
            backend: NetworkBackend::Bridge(bridge.into()),
            locking_mode: LockingMode::Unlocked,
        }
    }
}

// =============================================================================
// PCI PASSTHROUGH
// =============================================================================

/// Host PCI address (`dddd:bb:dd.f`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.device, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("Invalid PCI address: {}", s);

        let (domain, rest) = s.split_once(':').ok_or_else(bad)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(bad)?;
        let (device, function) = rest.split_once('.').ok_or_else(bad)?;

        let address = PciAddress {
            domain: u16::from_str_radix(domain, 16).map_err(|_| bad())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| bad())?,
            device: u8::from_str_radix(device, 16).map_err(|_| bad())?,
            function: u8::from_str_radix(function, 16).map_err(|_| bad())?,
        };

        if address.device > 0x1f || address.function > 7 {
            return Err(bad());
        }
        Ok(address)
    }
}

/// PCI passthrough device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PciConfig {
    pub vm: String,
    pub id: String,
    /// Slot inside the guest
    pub position: u32,
    pub address: PciAddress,
    pub msitranslate: Option<bool>,
    pub power_mgmt: Option<bool>,
    #[serde(default)]
    pub permissive: bool,
}

// =============================================================================
// RUNTIME RECORDS
// =============================================================================

/// Why a domain stopped running on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownReason {
    Halt,
    Reboot,
    Suspend,
    Crash,
}

/// Kind of unattended domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    Shutdown(ShutdownReason),
}

/// Event published by the backend when a domain changes state on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub domid: DomId,
    pub kind: DomainEventKind,
}

/// Runtime information about a domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub domid: DomId,
    pub memory_actual_mib: u64,
    pub vcpus_online: u32,
    pub rtc_timeoffset: String,
    /// Key/value pairs reported by the guest agent
    pub guest_agent: BTreeMap<String, String>,
    pub paused: bool,
}

/// Options for an outgoing migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateOptions {
    /// Keep the guest running while memory is copied
    #[serde(default)]
    pub live: bool,
    /// Vif id -> bridge on the destination
    #[serde(default)]
    pub vif_map: BTreeMap<String, String>,
    /// Vbd id -> disk on the destination
    #[serde(default)]
    pub vdi_map: BTreeMap<String, DiskRef>,
}

/// Host CPU description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCpuInfo {
    pub vendor: String,
    pub model: String,
    pub cpu_count: u32,
    pub socket_count: u32,
    pub speed_mhz: u64,
    /// CPU feature flags as reported by the kernel
    pub flags: Vec<String>,
    /// Feature words, hex, dash separated (e.g. "1fcbfbff-f7fa3223")
    pub features: String,
}
