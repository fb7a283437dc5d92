//! Admission checks for every state-changing operation.
//!
//! These are pure functions of configuration and observed state. The
//! service runs them once when a request arrives, so that illegal requests
//! are rejected before any task exists, and again when the task actually
//! starts executing, since the object may have changed while it was queued.

use vmplane_hypervisor::{BootMethod, PvBoot, VbdConfig, VbdType, VmConfig};

use crate::error::{Error, Result};
use crate::model::{DeviceRef, DeviceStatus, ObjectKind, PowerState, VbdState, VmState};

use PowerState::*;

/// VM operations subject to admission checks.
#[derive(Debug, Clone, PartialEq)]
pub enum VmOp {
    Start,
    Shutdown,
    Reboot,
    Pause,
    Unpause,
    Suspend,
    Resume,
    Create,
    Build,
    CreateDeviceModel,
    Destroy,
    Migrate,
    SetVcpus(u32),
    SetMemoryDynamicRange { min_mib: u64, max_mib: u64 },
    SetShadowMultiplier(f64),
    SetXsdata,
    Remove,
}

/// Device operations subject to admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Plug,
    Unplug,
    Remove,
}

/// Media operations on ejectable block devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOp {
    Eject,
    Insert,
}

fn require_power(actual: PowerState, expected: &[PowerState]) -> Result<()> {
    if expected.contains(&actual) {
        Ok(())
    } else {
        Err(Error::bad_power_state(expected, actual))
    }
}

/// Check that `op` is legal for a VM with the given configuration and state.
pub fn check_vm_op(config: &VmConfig, state: &VmState, op: &VmOp) -> Result<()> {
    let power = state.power_state;

    match op {
        VmOp::Start => {
            require_power(power, &[Halted])?;
            validate_vm_config(config)
        }
        VmOp::Shutdown => require_power(power, &[Running, Paused, Suspended]),
        VmOp::Reboot => require_power(power, &[Running, Paused, Suspended]),
        VmOp::Pause => require_power(power, &[Running]),
        VmOp::Unpause => {
            require_power(power, &[Paused])?;
            if !state.built {
                return Err(Error::DomainNotBuilt {
                    vm: config.id.clone(),
                });
            }
            Ok(())
        }
        VmOp::Suspend => require_power(power, &[Running, Paused]),
        VmOp::Resume => require_power(power, &[Suspended]),
        VmOp::Create => {
            require_power(power, &[Halted])?;
            validate_vm_config(config)
        }
        VmOp::Build => {
            if state.domid().is_none() {
                return Err(Error::bad_power_state(&[Paused], power));
            }
            if state.built {
                return Err(Error::invalid_argument(format!("domain of VM {} is already built", config.id)));
            }
            Ok(())
        }
        VmOp::CreateDeviceModel => {
            if state.domid().is_none() || !state.built {
                return Err(Error::DomainNotBuilt {
                    vm: config.id.clone(),
                });
            }
            if state.device_model_running {
                return Err(Error::invalid_argument(format!(
                    "device model of VM {} is already running",
                    config.id
                )));
            }
            Ok(())
        }
        VmOp::Destroy => {
            if state.domid().is_some() {
                Ok(())
            } else {
                require_power(power, &[Running, Paused, Suspended])
            }
        }
        VmOp::Migrate => require_power(power, &[Running, Paused]),
        VmOp::SetVcpus(n) => {
            if *n < 1 || *n > config.vcpus.max {
                return Err(Error::InvalidVcpus {
                    requested: *n,
                    max: config.vcpus.max,
                });
            }
            Ok(())
        }
        VmOp::SetMemoryDynamicRange { min_mib, max_mib } => {
            if min_mib > max_mib || *max_mib > config.memory.static_max_mib {
                return Err(Error::InvalidMemoryRange {
                    min_mib: *min_mib,
                    max_mib: *max_mib,
                    static_max_mib: config.memory.static_max_mib,
                });
            }
            Ok(())
        }
        VmOp::SetShadowMultiplier(multiplier) => {
            if !config.is_hvm() {
                return Err(Error::Unimplemented {
                    operation: "set_shadow_multiplier on a PV guest".to_string(),
                });
            }
            check_shadow_multiplier(*multiplier)
        }
        VmOp::SetXsdata => Ok(()),
        VmOp::Remove => {
            require_power(power, &[Halted])?;
            if state.domid().is_some() {
                return Err(Error::invalid_argument(format!("VM {} still has a domain", config.id)));
            }
            Ok(())
        }
    }
}

fn check_shadow_multiplier(multiplier: f64) -> Result<()> {
    if multiplier.is_nan() || multiplier < 1.0 {
        return Err(Error::invalid_argument(format!(
            "shadow multiplier must be at least 1.0, got {}",
            multiplier
        )));
    }
    Ok(())
}

/// Check a VM configuration for internal consistency.
pub fn validate_vm_config(config: &VmConfig) -> Result<()> {
    if config.id.is_empty() {
        return Err(Error::invalid_argument("VM id must not be empty"));
    }

    let memory = &config.memory;
    if memory.static_max_mib == 0 || !memory.is_ordered() {
        return Err(Error::InvalidMemoryRange {
            min_mib: memory.dynamic_min_mib,
            max_mib: memory.dynamic_max_mib,
            static_max_mib: memory.static_max_mib,
        });
    }

    let vcpus = &config.vcpus;
    if vcpus.current < 1 || vcpus.current > vcpus.max {
        return Err(Error::InvalidVcpus {
            requested: vcpus.current,
            max: vcpus.max,
        });
    }

    match &config.boot {
        BootMethod::Pv(PvBoot::Direct { kernel, .. }) if kernel.is_empty() => {
            return Err(Error::invalid_argument("direct PV boot needs a kernel"));
        }
        BootMethod::Pv(PvBoot::Indirect { bootloader, .. }) if bootloader.is_empty() => {
            return Err(Error::invalid_argument("indirect PV boot needs a bootloader"));
        }
        BootMethod::Hvm(hvm) => {
            if hvm.boot_order.is_empty() || !hvm.boot_order.chars().all(|c| "acdn".contains(c)) {
                return Err(Error::invalid_argument(format!("invalid boot order '{}'", hvm.boot_order)));
            }
        }
        BootMethod::Pv(_) => {}
    }

    if config.is_hvm() {
        check_shadow_multiplier(config.shadow_multiplier)?;
    }
    Ok(())
}

/// Pick the disk a VM boots from.
///
/// Direct-kernel PV guests need none. Bootloader PV guests need a disk with
/// media, restricted to the configured device list when there is one. HVM
/// guests need one unless they boot from the network.
pub fn select_boot_disk<'a>(config: &VmConfig, vbds: &'a [VbdConfig]) -> Result<Option<&'a VbdConfig>> {
    let bootable = |vbd: &&VbdConfig| vbd.backend.is_some() && vbd.ty != VbdType::Floppy;

    match &config.boot {
        BootMethod::Pv(PvBoot::Direct { .. }) => Ok(None),
        BootMethod::Pv(PvBoot::Indirect { devices, .. }) => {
            let found = if devices.is_empty() {
                vbds.iter().find(bootable)
            } else {
                devices
                    .iter()
                    .find_map(|d| vbds.iter().filter(bootable).find(|v| &v.id == d))
            };
            found.map(Some).ok_or(Error::NoBootableDevice)
        }
        BootMethod::Hvm(hvm) => {
            let found = vbds.iter().find(bootable);
            if found.is_none() && !hvm.boots_from_network() {
                return Err(Error::NoBootableDevice);
            }
            Ok(found)
        }
    }
}

/// Check that a device operation is legal.
pub fn check_device_op(
    kind: ObjectKind,
    device: &DeviceRef,
    vm_power: PowerState,
    status: &DeviceStatus,
    op: DeviceOp,
) -> Result<()> {
    if !status.active {
        return Err(Error::does_not_exist(kind, device.to_string()));
    }

    match op {
        DeviceOp::Plug => {
            require_power(vm_power, &[Running, Paused])?;
            if status.plugged {
                return Err(Error::DeviceAlreadyConnected {
                    kind,
                    device: device.device.clone(),
                    vm: device.vm.clone(),
                });
            }
            Ok(())
        }
        DeviceOp::Unplug => {
            if !status.plugged {
                return Err(Error::DeviceNotConnected {
                    kind,
                    device: device.device.clone(),
                    vm: device.vm.clone(),
                });
            }
            Ok(())
        }
        DeviceOp::Remove => {
            if status.plugged {
                return Err(Error::DeviceAlreadyConnected {
                    kind,
                    device: device.device.clone(),
                    vm: device.vm.clone(),
                });
            }
            Ok(())
        }
    }
}

/// Refuse a non-forced unplug of a Vbd marked as not unpluggable.
pub fn check_vbd_unplug(vbd: &VbdConfig, force: bool) -> Result<()> {
    if !vbd.unpluggable && !force {
        return Err(Error::DeviceDetachRejected {
            kind: ObjectKind::Vbd,
            device: vbd.id.clone(),
            vm: vbd.vm.clone(),
            reason: "device is not unpluggable".to_string(),
        });
    }
    Ok(())
}

/// Check that a media operation is legal.
pub fn check_media_op(vbd: &VbdConfig, state: &VbdState, op: MediaOp) -> Result<()> {
    let (device, vm) = (vbd.id.clone(), vbd.vm.clone());

    if !vbd.is_ejectable() {
        return Err(Error::MediaNotEjectable { device, vm });
    }
    match op {
        MediaOp::Eject if !state.media_present => Err(Error::MediaNotPresent { device, vm }),
        MediaOp::Insert if state.media_present => Err(Error::MediaPresent { device, vm }),
        _ => Ok(()),
    }
}
