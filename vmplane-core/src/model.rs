//! Observed-state records and the snapshots published on the update feed.
//!
//! Configuration types live in `vmplane_hypervisor::types`; this module adds
//! what the control plane observes at runtime and pairs the two.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmplane_hypervisor::{
    Console, DiskRef, DomId, LockingMode, NetworkBackend, PciConfig, VbdConfig, VifConfig, VmConfig,
};

use crate::error::Error;

// =============================================================================
// IDENTITY
// =============================================================================

/// Kind of managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Vm,
    Vbd,
    Vif,
    Pci,
    Task,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Vm => "VM",
            ObjectKind::Vbd => "VBD",
            ObjectKind::Vif => "VIF",
            ObjectKind::Pci => "PCI",
            ObjectKind::Task => "task",
        };
        f.write_str(name)
    }
}

/// Identifier of a device: owning VM plus device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceRef {
    pub vm: String,
    pub device: String,
}

impl DeviceRef {
    pub fn new(vm: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            vm: vm.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vm, self.device)
    }
}

// =============================================================================
// VM
// =============================================================================

/// VM power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    Halted,
    Running,
    Paused,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Halted => "Halted",
            PowerState::Running => "Running",
            PowerState::Paused => "Paused",
            PowerState::Suspended => "Suspended",
        };
        f.write_str(name)
    }
}

/// Observed state of a VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub power_state: PowerState,
    /// Live domains. More than one only while a migration is in flight.
    pub domids: Vec<DomId>,
    pub consoles: Vec<Console>,
    pub memory_target_mib: u64,
    pub memory_actual_mib: u64,
    pub vcpu_target: u32,
    pub shadow_multiplier_target: f64,
    pub rtc_timeoffset: String,
    pub guest_agent: BTreeMap<String, String>,
    /// The current domain has had its kernel or firmware loaded
    pub built: bool,
    pub device_model_running: bool,
    /// Where the memory image of a suspended VM lives
    pub suspend_image: Option<DiskRef>,
    pub last_start_time: Option<DateTime<Utc>>,
}

impl VmState {
    /// The VM's current domain, if any.
    pub fn domid(&self) -> Option<DomId> {
        self.domids.first().copied()
    }

    /// Clear everything tied to a live domain.
    pub(crate) fn reset_domain(&mut self) {
        self.domids.clear();
        self.consoles.clear();
        self.built = false;
        self.device_model_running = false;
        self.memory_actual_mib = 0;
        self.guest_agent.clear();
    }
}

/// A VM's configuration paired with its observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub config: VmConfig,
    pub state: VmState,
}

impl Vm {
    /// A freshly added, halted VM.
    pub fn new(config: VmConfig) -> Self {
        let state = VmState {
            memory_target_mib: config.memory.dynamic_max_mib,
            vcpu_target: config.vcpus.current,
            shadow_multiplier_target: config.shadow_multiplier,
            ..VmState::default()
        };
        Self { config, state }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

// =============================================================================
// DEVICES
// =============================================================================

/// Attachment status shared by all device kinds.
///
/// `active` means registered with the VM, `plugged` means attached to a
/// live domain. The two are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub active: bool,
    pub plugged: bool,
}

impl DeviceStatus {
    pub(crate) fn active() -> Self {
        Self {
            active: true,
            plugged: false,
        }
    }
}

/// Observed state of a block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbdState {
    pub status: DeviceStatus,
    pub media_present: bool,
    /// Host path handed to the hypervisor while plugged
    pub attached_path: Option<String>,
}

/// Observed state of a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifState {
    pub status: DeviceStatus,
    pub carrier: bool,
    pub locking_mode: LockingMode,
    pub backend: NetworkBackend,
}

/// Observed state of a PCI passthrough device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciState {
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vbd {
    pub config: VbdConfig,
    pub state: VbdState,
}

impl Vbd {
    pub fn new(config: VbdConfig) -> Self {
        let state = VbdState {
            status: DeviceStatus::active(),
            media_present: config.backend.is_some(),
            attached_path: None,
        };
        Self { config, state }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vif {
    pub config: VifConfig,
    pub state: VifState,
}

impl Vif {
    pub fn new(config: VifConfig) -> Self {
        let state = VifState {
            status: DeviceStatus::active(),
            carrier: config.carrier,
            locking_mode: config.locking_mode.clone(),
            backend: config.backend.clone(),
        };
        Self { config, state }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pci {
    pub config: PciConfig,
    pub state: PciState,
}

impl Pci {
    pub fn new(config: PciConfig) -> Self {
        Self {
            config,
            state: PciState {
                status: DeviceStatus::active(),
            },
        }
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// Task state. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    Pending {
        /// Fraction done, in [0, 1]
        progress: f64,
    },
    Completed {
        duration_secs: f64,
        result: Option<serde_json::Value>,
    },
    Failed {
        error: Error,
        backtrace: String,
    },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending { .. })
    }
}

/// Named step of a composite task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub name: String,
    pub state: TaskState,
}

/// Snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    /// Operation name, e.g. "VM.start"
    pub name: String,
    /// Caller-supplied debug token
    pub dbg: String,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    pub subtasks: Vec<SubTask>,
    pub cancel_requested: bool,
}

// =============================================================================
// FEED PAYLOADS
// =============================================================================

/// Identifier of any object that can appear on the update feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum DynamicId {
    Vm(String),
    Vbd(DeviceRef),
    Vif(DeviceRef),
    Pci(DeviceRef),
    Task(String),
}

impl DynamicId {
    /// VM the object belongs to, for everything but tasks.
    pub fn vm(&self) -> Option<&str> {
        match self {
            DynamicId::Vm(id) => Some(id),
            DynamicId::Vbd(r) | DynamicId::Vif(r) | DynamicId::Pci(r) => Some(&r.vm),
            DynamicId::Task(_) => None,
        }
    }
}

/// Snapshot of any object that can appear on the update feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DynamicValue {
    Vm(Vm),
    Vbd(Vbd),
    Vif(Vif),
    Pci(Pci),
    Task(TaskInfo),
}

/// Everything needed to recreate a VM on another host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMetadata {
    pub vm: VmConfig,
    #[serde(default)]
    pub vbds: Vec<VbdConfig>,
    #[serde(default)]
    pub vifs: Vec<VifConfig>,
    #[serde(default)]
    pub pcis: Vec<PciConfig>,
}
