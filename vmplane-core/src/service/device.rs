//! Vbd, Vif and Pci operations.

use std::future::Future;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use vmplane_hypervisor::{DiskRef, DomId, HypervisorError, LockingMode, NetworkBackend, PciConfig, VbdConfig, VbdMode, VifConfig};

use super::{domid_of, NodeService};
use crate::error::{Error, Result};
use crate::model::{DeviceRef, ObjectKind, Pci, PowerState, Vbd, Vif, Vm};
use crate::store::DeviceRecord;
use crate::task::TaskContext;
use crate::validator::{self, DeviceOp, MediaOp};

/// Turn a hypervisor detach refusal into an error naming the device.
fn detach_error(kind: ObjectKind, r: &DeviceRef, e: HypervisorError) -> Error {
    match e {
        HypervisorError::DetachRejected { reason, .. } => Error::DeviceDetachRejected {
            kind,
            device: r.device.clone(),
            vm: r.vm.clone(),
            reason,
        },
        other => other.into(),
    }
}

impl NodeService {
    // =========================================================================
    // Shared plumbing
    // =========================================================================

    /// Admit a device operation and run `body` as a task queued on the
    /// owning VM. `check` runs at admission and again at execution.
    fn submit_device_task<D, C, F, Fut>(&self, dbg: &str, name: &str, r: &DeviceRef, check: C, body: F) -> Result<String>
    where
        D: DeviceRecord,
        C: Fn(&Vm, &D) -> Result<()> + Send + 'static,
        F: FnOnce(NodeService, TaskContext, Vm, D) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let vm = self.store().vm(&r.vm)?;
        let device: D = self.store().device(r)?;
        check(&vm, &device)?;

        let svc = self.clone();
        let r = r.clone();
        let queue = r.vm.clone();
        let task = self.tasks().submit(dbg, name, Some(&queue), move |ctx| async move {
            let vm = svc.store().vm(&r.vm)?;
            let device: D = svc.store().device(&r)?;
            check(&vm, &device)?;
            body(svc, ctx, vm, device).await
        });
        Ok(task)
    }

    fn check_device<D: DeviceRecord>(op: DeviceOp) -> impl Fn(&Vm, &D) -> Result<()> + Send + 'static {
        move |vm, device| {
            validator::check_device_op(D::KIND, &device.device_ref(), vm.state.power_state, device.status(), op)
        }
    }

    fn add_device<D: DeviceRecord>(&self, device: D) -> Result<DeviceRef> {
        let r = self.store().add_device(device)?;
        info!(kind = %D::KIND, device = %r, "Device added");
        Ok(r)
    }

    fn remove_device<D: DeviceRecord>(&self, r: &DeviceRef) -> Result<()> {
        // Removal only depends on the device, not on the VM's power state,
        // but it must not pull a device out from under a queued or running
        // task on the owning VM.
        self.store().remove_device::<D, _>(r, |device| {
            self.tasks().check_idle(&r.vm)?;
            validator::check_device_op(D::KIND, r, PowerState::Halted, device.status(), DeviceOp::Remove)
        })?;
        info!(kind = %D::KIND, device = %r, "Device removed");
        Ok(())
    }

    // =========================================================================
    // Hypervisor steps
    // =========================================================================

    /// Resolve storage and attach a Vbd to a live domain.
    pub(super) async fn attach_vbd_now(&self, dbg: &str, domid: DomId, vbd: &Vbd) -> Result<()> {
        let r = vbd.device_ref();
        let attached = match &vbd.config.backend {
            Some(disk) => Some(
                self.storage()
                    .attach(dbg, disk, vbd.config.mode == VbdMode::ReadWrite)
                    .await?,
            ),
            None => None,
        };
        let path = attached.as_ref().map(|a| a.path.clone());

        if let Err(e) = self.hypervisor().attach_vbd(domid, &vbd.config, path.as_deref()).await {
            if let Some(disk) = &vbd.config.backend {
                self.release_disk(dbg, disk).await;
            }
            return Err(e.into());
        }

        let recorded = self.store().update_device::<Vbd, _>(&r, |d| {
            d.state.status.plugged = true;
            d.state.media_present = d.config.backend.is_some();
            d.state.attached_path = path;
        });
        if let Err(e) = recorded {
            // The record vanished mid-attach; leave nothing behind that no
            // object owns.
            warn!(device = %r, domid, error = %e, "VBD record gone after attach, detaching");
            if let Err(detach) = self.hypervisor().detach_vbd(domid, &vbd.config, true).await {
                warn!(device = %r, error = %detach, "Failed to detach orphaned VBD");
            }
            if let Some(disk) = &vbd.config.backend {
                self.release_disk(dbg, disk).await;
            }
            return Err(e);
        }
        debug!(device = %r, domid, "VBD attached");
        Ok(())
    }

    /// Detach a Vbd from its domain, if any, and release its storage.
    pub(super) async fn detach_vbd_now(&self, dbg: &str, domid: Option<DomId>, vbd: &Vbd, force: bool) -> Result<()> {
        let r = vbd.device_ref();
        if let Some(domid) = domid {
            self.hypervisor()
                .detach_vbd(domid, &vbd.config, force)
                .await
                .map_err(|e| detach_error(ObjectKind::Vbd, &r, e))?;
        }
        if vbd.state.attached_path.is_some() {
            if let Some(disk) = &vbd.config.backend {
                self.release_disk(dbg, disk).await;
            }
        }

        self.store().update_device::<Vbd, _>(&r, |d| {
            d.state.status.plugged = false;
            d.state.attached_path = None;
        })?;
        debug!(device = %r, "VBD detached");
        Ok(())
    }

    pub(super) async fn attach_vif_now(&self, domid: DomId, vif: &Vif) -> Result<()> {
        let r = vif.device_ref();
        self.hypervisor().attach_vif(domid, &vif.config).await?;
        let recorded = self.store().update_device::<Vif, _>(&r, |d| {
            d.state.status.plugged = true;
            d.state.carrier = d.config.carrier;
            d.state.locking_mode = d.config.locking_mode.clone();
            d.state.backend = d.config.backend.clone();
        });
        if let Err(e) = recorded {
            warn!(device = %r, domid, error = %e, "VIF record gone after attach, detaching");
            if let Err(detach) = self.hypervisor().detach_vif(domid, &vif.config, true).await {
                warn!(device = %r, error = %detach, "Failed to detach orphaned VIF");
            }
            return Err(e);
        }
        debug!(device = %r, domid, "VIF attached");
        Ok(())
    }

    pub(super) async fn detach_vif_now(&self, domid: Option<DomId>, vif: &Vif, force: bool) -> Result<()> {
        let r = vif.device_ref();
        if let Some(domid) = domid {
            self.hypervisor()
                .detach_vif(domid, &vif.config, force)
                .await
                .map_err(|e| detach_error(ObjectKind::Vif, &r, e))?;
        }
        self.store().update_device::<Vif, _>(&r, |d| d.state.status.plugged = false)?;
        debug!(device = %r, "VIF detached");
        Ok(())
    }

    pub(super) async fn attach_pci_now(&self, domid: DomId, pci: &Pci) -> Result<()> {
        let r = pci.device_ref();
        self.hypervisor().attach_pci(domid, &pci.config).await?;
        if let Err(e) = self.store().update_device::<Pci, _>(&r, |d| d.state.status.plugged = true) {
            warn!(device = %r, domid, error = %e, "PCI record gone after attach, detaching");
            if let Err(detach) = self.hypervisor().detach_pci(domid, &pci.config, true).await {
                warn!(device = %r, error = %detach, "Failed to detach orphaned PCI device");
            }
            return Err(e);
        }
        debug!(device = %r, domid, address = %pci.config.address, "PCI device attached");
        Ok(())
    }

    pub(super) async fn detach_pci_now(&self, domid: Option<DomId>, pci: &Pci, force: bool) -> Result<()> {
        let r = pci.device_ref();
        if let Some(domid) = domid {
            self.hypervisor()
                .detach_pci(domid, &pci.config, force)
                .await
                .map_err(|e| detach_error(ObjectKind::Pci, &r, e))?;
        }
        self.store().update_device::<Pci, _>(&r, |d| d.state.status.plugged = false)?;
        debug!(device = %r, "PCI device detached");
        Ok(())
    }

    /// Detach a disk from the host, logging instead of failing.
    pub(super) async fn release_disk(&self, dbg: &str, disk: &DiskRef) {
        if let Err(e) = self.storage().detach(dbg, disk).await {
            warn!(disk = %disk, error = %e, "Failed to release disk");
        }
    }

    // =========================================================================
    // VBD
    // =========================================================================

    #[instrument(skip(self, config), fields(vm_id = %config.vm, vbd = %config.id))]
    pub fn add_vbd(&self, dbg: &str, config: VbdConfig) -> Result<DeviceRef> {
        self.add_device(Vbd::new(config))
    }

    #[instrument(skip(self))]
    pub fn remove_vbd(&self, dbg: &str, r: &DeviceRef) -> Result<()> {
        self.remove_device::<Vbd>(r)
    }

    #[instrument(skip(self))]
    pub fn plug_vbd(&self, dbg: &str, r: &DeviceRef) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VBD.plug",
            r,
            Self::check_device::<Vbd>(DeviceOp::Plug),
            |svc, ctx, vm, vbd| async move {
                let domid = domid_of(&vm)?;
                svc.attach_vbd_now(&ctx.dbg(), domid, &vbd).await?;
                Ok(None)
            },
        )
    }

    #[instrument(skip(self))]
    pub fn unplug_vbd(&self, dbg: &str, r: &DeviceRef, force: bool) -> Result<String> {
        let plugged = Self::check_device::<Vbd>(DeviceOp::Unplug);
        self.submit_device_task(
            dbg,
            "VBD.unplug",
            r,
            move |vm, vbd: &Vbd| {
                plugged(vm, vbd)?;
                validator::check_vbd_unplug(&vbd.config, force)
            },
            move |svc, ctx, vm, vbd| async move {
                svc.detach_vbd_now(&ctx.dbg(), vm.state.domid(), &vbd, force).await?;
                Ok(None)
            },
        )
    }

    /// Remove the media from an ejectable drive.
    #[instrument(skip(self))]
    pub fn eject_vbd(&self, dbg: &str, r: &DeviceRef) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VBD.eject",
            r,
            |_, vbd: &Vbd| validator::check_media_op(&vbd.config, &vbd.state, MediaOp::Eject),
            |svc, ctx, vm, vbd| async move {
                let r = vbd.device_ref();
                let dbg = ctx.dbg();
                if vbd.state.status.plugged {
                    let domid = domid_of(&vm)?;
                    svc.hypervisor().change_media(domid, &vbd.config, None).await?;
                    if let Some(disk) = &vbd.config.backend {
                        svc.release_disk(&dbg, disk).await;
                    }
                }
                svc.store().update_device::<Vbd, _>(&r, |d| {
                    d.config.backend = None;
                    d.state.media_present = false;
                    d.state.attached_path = None;
                })?;
                info!(device = %r, "Media ejected");
                Ok(None)
            },
        )
    }

    /// Put `disk` into an empty ejectable drive.
    #[instrument(skip(self))]
    pub fn insert_vbd(&self, dbg: &str, r: &DeviceRef, disk: DiskRef) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VBD.insert",
            r,
            |_, vbd: &Vbd| validator::check_media_op(&vbd.config, &vbd.state, MediaOp::Insert),
            move |svc, ctx, vm, vbd| async move {
                let r = vbd.device_ref();
                let mut attached_path = None;
                if vbd.state.status.plugged {
                    let domid = domid_of(&vm)?;
                    let dbg = ctx.dbg();
                    let attached = svc.storage().attach(&dbg, &disk, false).await?;
                    if let Err(e) = svc.hypervisor().change_media(domid, &vbd.config, Some(&attached.path)).await {
                        svc.release_disk(&dbg, &disk).await;
                        return Err(e.into());
                    }
                    attached_path = Some(attached.path);
                }
                svc.store().update_device::<Vbd, _>(&r, |d| {
                    d.config.backend = Some(disk);
                    d.state.media_present = true;
                    d.state.attached_path = attached_path;
                })?;
                info!(device = %r, "Media inserted");
                Ok(None)
            },
        )
    }

    pub fn stat_vbd(&self, r: &DeviceRef) -> Result<Vbd> {
        self.store().device(r)
    }

    pub fn list_vbds(&self, vm: &str) -> Result<Vec<Vbd>> {
        self.store().devices(vm)
    }

    // =========================================================================
    // VIF
    // =========================================================================

    #[instrument(skip(self, config), fields(vm_id = %config.vm, vif = %config.id))]
    pub fn add_vif(&self, dbg: &str, config: VifConfig) -> Result<DeviceRef> {
        self.add_device(Vif::new(config))
    }

    #[instrument(skip(self))]
    pub fn remove_vif(&self, dbg: &str, r: &DeviceRef) -> Result<()> {
        self.remove_device::<Vif>(r)
    }

    #[instrument(skip(self))]
    pub fn plug_vif(&self, dbg: &str, r: &DeviceRef) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VIF.plug",
            r,
            Self::check_device::<Vif>(DeviceOp::Plug),
            |svc, _ctx, vm, vif| async move {
                let domid = domid_of(&vm)?;
                svc.attach_vif_now(domid, &vif).await?;
                Ok(None)
            },
        )
    }

    #[instrument(skip(self))]
    pub fn unplug_vif(&self, dbg: &str, r: &DeviceRef, force: bool) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VIF.unplug",
            r,
            Self::check_device::<Vif>(DeviceOp::Unplug),
            move |svc, _ctx, vm, vif| async move {
                svc.detach_vif_now(vm.state.domid(), &vif, force).await?;
                Ok(None)
            },
        )
    }

    /// Reconnect a Vif to another network backend.
    #[instrument(skip(self))]
    pub fn move_vif(&self, dbg: &str, r: &DeviceRef, backend: NetworkBackend) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VIF.move",
            r,
            |_, _: &Vif| Ok(()),
            move |svc, _ctx, vm, vif| async move {
                if vif.state.status.plugged {
                    let domid = domid_of(&vm)?;
                    svc.hypervisor().move_vif(domid, &vif.config, &backend).await?;
                }
                svc.store().update_device::<Vif, _>(&vif.device_ref(), |d| {
                    d.config.backend = backend.clone();
                    d.state.backend = backend;
                })?;
                Ok(None)
            },
        )
    }

    #[instrument(skip(self))]
    pub fn set_vif_carrier(&self, dbg: &str, r: &DeviceRef, carrier: bool) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VIF.set_carrier",
            r,
            |_, _: &Vif| Ok(()),
            move |svc, _ctx, vm, vif| async move {
                if vif.state.status.plugged {
                    let domid = domid_of(&vm)?;
                    svc.hypervisor().set_carrier(domid, &vif.config, carrier).await?;
                }
                svc.store().update_device::<Vif, _>(&vif.device_ref(), |d| {
                    d.config.carrier = carrier;
                    d.state.carrier = carrier;
                })?;
                Ok(None)
            },
        )
    }

    #[instrument(skip(self, mode))]
    pub fn set_vif_locking_mode(&self, dbg: &str, r: &DeviceRef, mode: LockingMode) -> Result<String> {
        self.submit_device_task(
            dbg,
            "VIF.set_locking_mode",
            r,
            |_, _: &Vif| Ok(()),
            move |svc, _ctx, vm, vif| async move {
                if vif.state.status.plugged {
                    let domid = domid_of(&vm)?;
                    svc.hypervisor().set_locking_mode(domid, &vif.config, &mode).await?;
                }
                svc.store().update_device::<Vif, _>(&vif.device_ref(), |d| {
                    d.config.locking_mode = mode.clone();
                    d.state.locking_mode = mode;
                })?;
                Ok(None)
            },
        )
    }

    pub fn stat_vif(&self, r: &DeviceRef) -> Result<Vif> {
        self.store().device(r)
    }

    pub fn list_vifs(&self, vm: &str) -> Result<Vec<Vif>> {
        self.store().devices(vm)
    }

    // =========================================================================
    // PCI
    // =========================================================================

    #[instrument(skip(self, config), fields(vm_id = %config.vm, pci = %config.id))]
    pub fn add_pci(&self, dbg: &str, config: PciConfig) -> Result<DeviceRef> {
        self.add_device(Pci::new(config))
    }

    #[instrument(skip(self))]
    pub fn remove_pci(&self, dbg: &str, r: &DeviceRef) -> Result<()> {
        self.remove_device::<Pci>(r)
    }

    #[instrument(skip(self))]
    pub fn plug_pci(&self, dbg: &str, r: &DeviceRef) -> Result<String> {
        self.submit_device_task(
            dbg,
            "PCI.plug",
            r,
            Self::check_device::<Pci>(DeviceOp::Plug),
            |svc, _ctx, vm, pci| async move {
                let domid = domid_of(&vm)?;
                svc.attach_pci_now(domid, &pci).await?;
                Ok(None)
            },
        )
    }

    #[instrument(skip(self))]
    pub fn unplug_pci(&self, dbg: &str, r: &DeviceRef, force: bool) -> Result<String> {
        self.submit_device_task(
            dbg,
            "PCI.unplug",
            r,
            Self::check_device::<Pci>(DeviceOp::Unplug),
            move |svc, _ctx, vm, pci| async move {
                svc.detach_pci_now(vm.state.domid(), &pci, force).await?;
                Ok(None)
            },
        )
    }

    pub fn stat_pci(&self, r: &DeviceRef) -> Result<Pci> {
        self.store().device(r)
    }

    pub fn list_pcis(&self, vm: &str) -> Result<Vec<Pci>> {
        self.store().devices(vm)
    }
}
