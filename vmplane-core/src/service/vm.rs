//! VM operations.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use vmplane_hypervisor::{
    BootMethod, DiskRef, DomId, HypervisorError, MigrateOptions, PvBoot, ShutdownReason, VbdConfig, VmConfig,
};

use super::hooks::{
    REASON_CLEAN_REBOOT, REASON_CLEAN_SHUTDOWN, REASON_HARD_REBOOT, REASON_HARD_SHUTDOWN, REASON_NONE,
    VM_POST_DESTROY, VM_PRE_START,
};
use super::{domid_of, NodeService};
use crate::error::{Error, Result};
use crate::model::{ObjectKind, Pci, PowerState, Vbd, Vif, Vm, VmMetadata};
use crate::store::DeviceRecord;
use crate::task::TaskContext;
use crate::validator::{self, VmOp};

fn ensure_unique<'a>(kind: ObjectKind, vm: &str, ids: impl Iterator<Item = &'a String>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(Error::invalid_argument(format!("duplicate {} {} in metadata of VM {}", kind, id, vm)));
        }
    }
    Ok(())
}

impl NodeService {
    // =========================================================================
    // Inventory
    // =========================================================================

    /// Register a VM. The VM starts Halted.
    #[instrument(skip(self, config), fields(vm_id = %config.id, name = %config.name))]
    pub fn add_vm(&self, dbg: &str, config: VmConfig) -> Result<String> {
        validator::validate_vm_config(&config)?;
        let id = config.id.clone();
        self.store().add_vm(Vm::new(config))?;
        info!("VM added");
        Ok(id)
    }

    /// Forget a halted VM and all of its devices.
    ///
    /// Refused with `TaskInProgress` while any task on the VM is queued or
    /// running.
    #[instrument(skip(self))]
    pub fn remove_vm(&self, dbg: &str, id: &str) -> Result<()> {
        self.store().remove_vm(id, |vm| {
            self.tasks().check_idle(id)?;
            validator::check_vm_op(&vm.config, &vm.state, &VmOp::Remove)
        })?;
        info!("VM removed");
        Ok(())
    }

    pub fn stat_vm(&self, id: &str) -> Result<Vm> {
        self.store().vm(id)
    }

    pub fn list_vms(&self) -> Result<Vec<Vm>> {
        self.store().vms()
    }

    pub fn vm_exists(&self, id: &str) -> bool {
        self.store().vm_exists(id)
    }

    /// Serialize a VM's configuration and its devices' configurations.
    pub fn export_metadata(&self, id: &str) -> Result<String> {
        let vm = self.store().vm(id)?;
        let metadata = VmMetadata {
            vm: vm.config,
            vbds: self.store().devices::<Vbd>(id)?.into_iter().map(|d| d.config).collect(),
            vifs: self.store().devices::<Vif>(id)?.into_iter().map(|d| d.config).collect(),
            pcis: self.store().devices::<Pci>(id)?.into_iter().map(|d| d.config).collect(),
        };
        serde_json::to_string_pretty(&metadata).map_err(|e| Error::internal(format!("cannot encode metadata: {}", e)))
    }

    /// Register a VM and its devices from exported metadata.
    #[instrument(skip(self, metadata))]
    pub fn import_metadata(&self, dbg: &str, metadata: &str) -> Result<String> {
        let metadata: VmMetadata = serde_json::from_str(metadata)
            .map_err(|e| Error::invalid_argument(format!("invalid metadata: {}", e)))?;
        validator::validate_vm_config(&metadata.vm)?;

        let id = metadata.vm.id.clone();
        let owners = metadata
            .vbds
            .iter()
            .map(|d| &d.vm)
            .chain(metadata.vifs.iter().map(|d| &d.vm))
            .chain(metadata.pcis.iter().map(|d| &d.vm));
        for owner in owners {
            if *owner != id {
                return Err(Error::invalid_argument(format!(
                    "device of VM {} in metadata of VM {}",
                    owner, id
                )));
            }
        }
        ensure_unique(ObjectKind::Vbd, &id, metadata.vbds.iter().map(|d| &d.id))?;
        ensure_unique(ObjectKind::Vif, &id, metadata.vifs.iter().map(|d| &d.id))?;
        ensure_unique(ObjectKind::Pci, &id, metadata.pcis.iter().map(|d| &d.id))?;

        self.store().add_vm_with_devices(
            Vm::new(metadata.vm),
            metadata.vbds.into_iter().map(Vbd::new).collect(),
            metadata.vifs.into_iter().map(Vif::new).collect(),
            metadata.pcis.into_iter().map(Pci::new).collect(),
        )?;
        info!(vm_id = %id, "VM imported");
        Ok(id)
    }

    // =========================================================================
    // Lifecycle steps
    // =========================================================================

    /// Create an empty paused domain for the VM.
    async fn create_step(&self, id: &str) -> Result<DomId> {
        let vm = self.store().vm(id)?;
        let needed_mib = vm.config.memory.static_max_mib;
        let free_mib = self.hypervisor().free_memory_mib().await?;
        if needed_mib > free_mib {
            return Err(Error::InsufficientMemory { needed_mib, free_mib });
        }

        let domid = self.hypervisor().create_domain(&vm.config).await?;
        if !vm.config.xsdata.is_empty() {
            self.hypervisor().write_xsdata(domid, &vm.config.xsdata).await?;
        }

        self.store().update_vm(id, |vm| {
            vm.state.reset_domain();
            vm.state.domids = vec![domid];
            vm.state.power_state = PowerState::Paused;
            vm.state.memory_target_mib = vm.config.memory.dynamic_max_mib;
            vm.state.vcpu_target = vm.config.vcpus.current;
            vm.state.shadow_multiplier_target = vm.config.shadow_multiplier;
        })?;
        debug!(vm_id = %id, domid, "Domain created");
        Ok(domid)
    }

    /// Load the kernel or firmware. Bootloader guests get their boot disk
    /// attached read-only for the duration of the build.
    async fn build_step(&self, dbg: &str, id: &str) -> Result<()> {
        let vm = self.store().vm(id)?;
        let domid = domid_of(&vm)?;
        let vbds: Vec<VbdConfig> = self
            .store()
            .devices::<Vbd>(id)?
            .into_iter()
            .map(|d| d.config)
            .collect();

        let boot_vbd = validator::select_boot_disk(&vm.config, &vbds)?;
        let boot_disk = match (&vm.config.boot, boot_vbd) {
            (BootMethod::Pv(PvBoot::Indirect { .. }), Some(vbd)) => vbd.backend.clone(),
            _ => None,
        };

        match boot_disk {
            Some(disk) => {
                let attached = self.storage().attach(dbg, &disk, false).await?;
                let built = self
                    .hypervisor()
                    .build_domain(domid, &vm.config, Some(&attached.path))
                    .await;
                self.release_disk(dbg, &disk).await;
                built?;
            }
            None => self.hypervisor().build_domain(domid, &vm.config, None).await?,
        }

        self.store().update_vm(id, |vm| vm.state.built = true)?;
        debug!(vm_id = %id, domid, "Domain built");
        Ok(())
    }

    async fn device_model_step(&self, id: &str, restore: bool) -> Result<()> {
        let vm = self.store().vm(id)?;
        let domid = domid_of(&vm)?;
        let consoles = self
            .hypervisor()
            .create_device_model(domid, &vm.config, restore)
            .await?;
        self.store().update_vm(id, |vm| {
            vm.state.consoles = consoles;
            vm.state.device_model_running = true;
        })?;
        Ok(())
    }

    async fn unpause_step(&self, id: &str, starting: bool) -> Result<()> {
        let vm = self.store().vm(id)?;
        let domid = domid_of(&vm)?;
        self.hypervisor().unpause_domain(domid).await?;
        let info = self.hypervisor().domain_info(domid).await?;

        self.store().update_vm(id, |vm| {
            vm.state.power_state = PowerState::Running;
            vm.state.memory_actual_mib = info.memory_actual_mib;
            vm.state.rtc_timeoffset = info.rtc_timeoffset;
            vm.state.guest_agent = info.guest_agent;
            if starting {
                vm.state.last_start_time = Some(Utc::now());
            }
        })?;
        Ok(())
    }

    /// Tear down every domain of the VM and mark its devices unplugged.
    async fn destroy_step(&self, dbg: &str, id: &str) -> Result<()> {
        let vm = self.store().vm(id)?;
        for domid in &vm.state.domids {
            match self.hypervisor().destroy_domain(*domid).await {
                Ok(()) => debug!(vm_id = %id, domid, "Domain destroyed"),
                Err(HypervisorError::DomainNotFound(_)) => {
                    debug!(vm_id = %id, domid, "Domain already gone")
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.release_devices(dbg, id).await?;

        self.store().update_vm(id, |vm| {
            vm.state.reset_domain();
            vm.state.power_state = PowerState::Halted;
            vm.state.suspend_image = None;
        })?;
        Ok(())
    }

    /// Mark every plugged device unplugged after its domain has gone away.
    async fn release_devices(&self, dbg: &str, id: &str) -> Result<()> {
        for vbd in self.store().devices::<Vbd>(id)? {
            if !vbd.state.status.plugged {
                continue;
            }
            if let (Some(_), Some(disk)) = (&vbd.state.attached_path, &vbd.config.backend) {
                self.release_disk(dbg, disk).await;
            }
            self.store().update_device::<Vbd, _>(&vbd.device_ref(), |d| {
                d.state.status.plugged = false;
                d.state.attached_path = None;
            })?;
        }
        for vif in self.store().devices::<Vif>(id)? {
            if vif.state.status.plugged {
                self.store()
                    .update_device::<Vif, _>(&vif.device_ref(), |d| d.state.status.plugged = false)?;
            }
        }
        for pci in self.store().devices::<Pci>(id)? {
            if pci.state.status.plugged {
                self.store()
                    .update_device::<Pci, _>(&pci.device_ref(), |d| d.state.status.plugged = false)?;
            }
        }
        Ok(())
    }

    /// Attach every device that is not plugged yet, one sub-task each.
    async fn plug_devices(&self, ctx: &TaskContext, id: &str, domid: DomId) -> Result<()> {
        let dbg = ctx.dbg();

        for vbd in self.store().devices::<Vbd>(id)? {
            if !vbd.state.status.plugged {
                let step = format!("VBD.plug {}", vbd.config.id);
                ctx.subtask(&step, self.attach_vbd_now(&dbg, domid, &vbd)).await?;
            }
        }

        let mut vifs = self.store().devices::<Vif>(id)?;
        vifs.sort_by_key(|v| v.config.position);
        for vif in vifs {
            if !vif.state.status.plugged {
                let step = format!("VIF.plug {}", vif.config.id);
                ctx.subtask(&step, self.attach_vif_now(domid, &vif)).await?;
            }
        }

        let mut pcis = self.store().devices::<Pci>(id)?;
        pcis.sort_by_key(|p| p.config.position);
        for pci in pcis {
            if !pci.state.status.plugged {
                let step = format!("PCI.plug {}", pci.config.id);
                ctx.subtask(&step, self.attach_pci_now(domid, &pci)).await?;
            }
        }
        Ok(())
    }

    /// Create, build, plug devices, start the device model and unpause.
    pub(super) async fn start_sequence(&self, ctx: &TaskContext, id: &str) -> Result<()> {
        let dbg = ctx.dbg();

        let domid = ctx.subtask("VM.create", self.create_step(id)).await?;
        ctx.set_progress(0.2);
        ctx.subtask("VM.build", self.build_step(&dbg, id)).await?;
        ctx.set_progress(0.4);
        self.plug_devices(ctx, id, domid).await?;
        ctx.set_progress(0.7);
        ctx.subtask("VM.create_device_model", self.device_model_step(id, false))
            .await?;
        ctx.set_progress(0.9);
        ctx.subtask("VM.unpause", self.unpause_step(id, true)).await?;
        Ok(())
    }

    /// Ask the guest to go down and wait for it, giving up on cancellation.
    async fn clean_shutdown(&self, ctx: &TaskContext, domid: DomId, reason: ShutdownReason, timeout: Duration) -> Result<()> {
        ctx.cancellable(async {
            self.hypervisor()
                .shutdown_domain(domid, reason, timeout)
                .await
                .map_err(Error::from)
        })
        .await
    }

    /// Destroy the VM's domain and run the post-destroy hooks.
    pub(super) async fn destroy_sequence(&self, ctx: &TaskContext, id: &str, reason: &str) -> Result<()> {
        ctx.subtask("VM.destroy", self.destroy_step(&ctx.dbg(), id)).await?;
        self.run_hooks(VM_POST_DESTROY, id, reason).await
    }

    // =========================================================================
    // Power operations
    // =========================================================================

    /// Boot a halted VM.
    #[instrument(skip(self))]
    pub fn start_vm(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.start", id, VmOp::Start, move |svc, ctx| async move {
            info!(vm_id = %vm_id, "Starting VM");
            svc.run_hooks(VM_PRE_START, &vm_id, REASON_NONE).await?;
            svc.start_sequence(&ctx, &vm_id).await?;
            info!(vm_id = %vm_id, "VM started");
            Ok(None)
        })
    }

    /// Halt a VM. With a deadline the guest is asked to shut down first and
    /// the task fails with `ShutdownTimeout` if it does not comply; without
    /// one the domain is destroyed outright. A suspended VM loses its image.
    #[instrument(skip(self))]
    pub fn shutdown_vm(&self, dbg: &str, id: &str, deadline: Option<Duration>) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.shutdown", id, VmOp::Shutdown, move |svc, ctx| async move {
            info!(vm_id = %vm_id, ?deadline, "Shutting down VM");
            let vm = svc.store().vm(&vm_id)?;
            let reason = match (deadline, vm.state.domid()) {
                (Some(timeout), Some(domid)) => {
                    ctx.subtask(
                        "VM.shutdown",
                        svc.clean_shutdown(&ctx, domid, ShutdownReason::Halt, timeout),
                    )
                    .await?;
                    REASON_CLEAN_SHUTDOWN
                }
                _ => REASON_HARD_SHUTDOWN,
            };
            ctx.set_progress(0.5);
            svc.destroy_sequence(&ctx, &vm_id, reason).await?;
            info!(vm_id = %vm_id, "VM halted");
            Ok(None)
        })
    }

    /// Restart a running, paused or suspended VM. It passes through Halted,
    /// so a suspended VM loses its image and boots afresh.
    #[instrument(skip(self))]
    pub fn reboot_vm(&self, dbg: &str, id: &str, deadline: Option<Duration>) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.reboot", id, VmOp::Reboot, move |svc, ctx| async move {
            info!(vm_id = %vm_id, ?deadline, "Rebooting VM");
            let vm = svc.store().vm(&vm_id)?;
            let reason = match (deadline, vm.state.domid()) {
                (Some(timeout), Some(domid)) => {
                    ctx.subtask(
                        "VM.shutdown",
                        svc.clean_shutdown(&ctx, domid, ShutdownReason::Reboot, timeout),
                    )
                    .await?;
                    REASON_CLEAN_REBOOT
                }
                _ => REASON_HARD_REBOOT,
            };
            svc.destroy_sequence(&ctx, &vm_id, reason).await?;
            ctx.set_progress(0.3);
            svc.run_hooks(VM_PRE_START, &vm_id, reason).await?;
            svc.start_sequence(&ctx, &vm_id).await?;
            info!(vm_id = %vm_id, "VM rebooted");
            Ok(None)
        })
    }

    #[instrument(skip(self))]
    pub fn pause_vm(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.pause", id, VmOp::Pause, move |svc, _ctx| async move {
            let domid = domid_of(&svc.store().vm(&vm_id)?)?;
            svc.hypervisor().pause_domain(domid).await?;
            svc.store()
                .update_vm(&vm_id, |vm| vm.state.power_state = PowerState::Paused)?;
            info!(vm_id = %vm_id, "VM paused");
            Ok(None)
        })
    }

    #[instrument(skip(self))]
    pub fn unpause_vm(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.unpause", id, VmOp::Unpause, move |svc, _ctx| async move {
            svc.unpause_step(&vm_id, false).await?;
            info!(vm_id = %vm_id, "VM unpaused");
            Ok(None)
        })
    }

    /// Save the VM's memory to `disk` and release its domain.
    #[instrument(skip(self))]
    pub fn suspend_vm(&self, dbg: &str, id: &str, disk: DiskRef) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.suspend", id, VmOp::Suspend, move |svc, ctx| async move {
            let dbg = ctx.dbg();
            let domid = domid_of(&svc.store().vm(&vm_id)?)?;

            ctx.subtask("VM.save", async {
                let target = svc.storage().attach(&dbg, &disk, true).await?;
                if target.read_only {
                    svc.release_disk(&dbg, &disk).await;
                    return Err(Error::StorageBackend {
                        backend: svc.storage().name().to_string(),
                        messages: vec![format!("suspend image {} is not writable", disk)],
                    });
                }
                let saved = svc.hypervisor().suspend_domain(domid, &target.path).await;
                svc.release_disk(&dbg, &disk).await;
                saved.map_err(Error::from)
            })
            .await?;
            ctx.set_progress(0.8);

            svc.release_devices(&dbg, &vm_id).await?;
            svc.store().update_vm(&vm_id, |vm| {
                vm.state.reset_domain();
                vm.state.power_state = PowerState::Suspended;
                vm.state.suspend_image = Some(disk);
            })?;
            info!(vm_id = %vm_id, "VM suspended");
            Ok(None)
        })
    }

    /// Bring a suspended VM back from the image in `disk`.
    #[instrument(skip(self))]
    pub fn resume_vm(&self, dbg: &str, id: &str, disk: DiskRef) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.resume", id, VmOp::Resume, move |svc, ctx| async move {
            let dbg = ctx.dbg();

            let domid = ctx.subtask("VM.create", svc.create_step(&vm_id)).await?;
            ctx.subtask("VM.restore", async {
                let vm = svc.store().vm(&vm_id)?;
                let image = svc.storage().attach(&dbg, &disk, false).await?;
                let restored = svc
                    .hypervisor()
                    .restore_domain(domid, &vm.config, &image.path)
                    .await;
                svc.release_disk(&dbg, &disk).await;
                restored?;
                svc.store().update_vm(&vm_id, |vm| vm.state.built = true)?;
                Ok::<_, Error>(())
            })
            .await?;
            ctx.set_progress(0.4);

            svc.plug_devices(&ctx, &vm_id, domid).await?;
            ctx.set_progress(0.7);
            ctx.subtask("VM.create_device_model", svc.device_model_step(&vm_id, true))
                .await?;
            ctx.subtask("VM.unpause", svc.unpause_step(&vm_id, false)).await?;
            svc.store()
                .update_vm(&vm_id, |vm| vm.state.suspend_image = None)?;
            info!(vm_id = %vm_id, "VM resumed");
            Ok(None)
        })
    }

    /// Send the VM to `destination`. On success the VM no longer exists on
    /// this host.
    #[instrument(skip(self, options))]
    pub fn migrate_vm(&self, dbg: &str, id: &str, destination: &str, options: MigrateOptions) -> Result<String> {
        let vm_id = id.to_string();
        let destination = destination.to_string();
        self.submit_vm_task(dbg, "VM.migrate", id, VmOp::Migrate, move |svc, ctx| async move {
            info!(vm_id = %vm_id, destination = %destination, live = options.live, "Migrating VM");
            let domid = domid_of(&svc.store().vm(&vm_id)?)?;

            ctx.subtask(
                "VM.migrate",
                ctx.cancellable(async {
                    svc.hypervisor()
                        .migrate_domain(domid, &destination, &options)
                        .await
                        .map_err(Error::from)
                }),
            )
            .await?;
            ctx.set_progress(0.8);

            ctx.subtask("VM.destroy", svc.destroy_step(&ctx.dbg(), &vm_id)).await?;
            svc.store().remove_vm(&vm_id, |_| Ok(()))?;
            info!(vm_id = %vm_id, destination = %destination, "VM migrated");
            Ok(Some(json!({ "destination": destination })))
        })
    }

    // =========================================================================
    // Low-level steps
    // =========================================================================

    /// Create an empty paused domain without building it.
    #[instrument(skip(self))]
    pub fn create_vm(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.create", id, VmOp::Create, move |svc, _ctx| async move {
            let domid = svc.create_step(&vm_id).await?;
            Ok(Some(json!({ "domid": domid })))
        })
    }

    #[instrument(skip(self))]
    pub fn build_vm(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.build", id, VmOp::Build, move |svc, ctx| async move {
            svc.build_step(&ctx.dbg(), &vm_id).await?;
            Ok(None)
        })
    }

    #[instrument(skip(self))]
    pub fn create_device_model(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(
            dbg,
            "VM.create_device_model",
            id,
            VmOp::CreateDeviceModel,
            move |svc, _ctx| async move {
                svc.device_model_step(&vm_id, false).await?;
                Ok(None)
            },
        )
    }

    /// Destroy the VM's domain immediately.
    #[instrument(skip(self))]
    pub fn destroy_vm(&self, dbg: &str, id: &str) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.destroy", id, VmOp::Destroy, move |svc, ctx| async move {
            svc.destroy_sequence(&ctx, &vm_id, REASON_HARD_SHUTDOWN).await?;
            Ok(None)
        })
    }

    // =========================================================================
    // Runtime tuning
    // =========================================================================

    #[instrument(skip(self))]
    pub fn set_vcpus(&self, dbg: &str, id: &str, count: u32) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.set_vcpus", id, VmOp::SetVcpus(count), move |svc, _ctx| async move {
            if let Some(domid) = svc.store().vm(&vm_id)?.state.domid() {
                svc.hypervisor().set_vcpus(domid, count).await?;
            }
            svc.store().update_vm(&vm_id, |vm| {
                vm.config.vcpus.current = count;
                vm.state.vcpu_target = count;
            })?;
            Ok(None)
        })
    }

    /// Change the balloon range. Growth that the host cannot cover fails
    /// with `MemoryShortfall`.
    #[instrument(skip(self))]
    pub fn set_memory_dynamic_range(&self, dbg: &str, id: &str, min_mib: u64, max_mib: u64) -> Result<String> {
        let vm_id = id.to_string();
        let op = VmOp::SetMemoryDynamicRange { min_mib, max_mib };
        self.submit_vm_task(dbg, "VM.set_memory_dynamic_range", id, op, move |svc, _ctx| async move {
            let vm = svc.store().vm(&vm_id)?;
            let mut actual = None;

            if let Some(domid) = vm.state.domid() {
                let growth = max_mib.saturating_sub(vm.state.memory_target_mib);
                if growth > 0 {
                    let free = svc.hypervisor().free_memory_mib().await?;
                    if growth > free {
                        return Err(Error::MemoryShortfall {
                            shortfall_mib: growth - free,
                        });
                    }
                }
                svc.hypervisor()
                    .set_memory_target(domid, min_mib, max_mib)
                    .await
                    .map_err(|e| svc.balloon_error(e))?;
                actual = Some(svc.hypervisor().domain_info(domid).await?.memory_actual_mib);
            }

            svc.store().update_vm(&vm_id, |vm| {
                vm.config.memory.dynamic_min_mib = min_mib;
                vm.config.memory.dynamic_max_mib = max_mib;
                vm.state.memory_target_mib = max_mib;
                if let Some(actual) = actual {
                    vm.state.memory_actual_mib = actual;
                }
            })?;
            Ok(None)
        })
    }

    /// Name the VMs behind uncooperative domains.
    fn balloon_error(&self, e: HypervisorError) -> Error {
        match e {
            HypervisorError::BallooningFailed { uncooperative } => {
                let uncooperative = uncooperative
                    .into_iter()
                    .map(|domid| match self.store().vm_by_domid(domid) {
                        Ok(Some(vm)) => vm.config.id,
                        _ => format!("domid {}", domid),
                    })
                    .collect();
                warn!(?uncooperative, "Ballooning failed");
                Error::BallooningFailed { uncooperative }
            }
            other => other.into(),
        }
    }

    #[instrument(skip(self))]
    pub fn set_shadow_multiplier(&self, dbg: &str, id: &str, multiplier: f64) -> Result<String> {
        let vm_id = id.to_string();
        let op = VmOp::SetShadowMultiplier(multiplier);
        self.submit_vm_task(dbg, "VM.set_shadow_multiplier", id, op, move |svc, _ctx| async move {
            if let Some(domid) = svc.store().vm(&vm_id)?.state.domid() {
                svc.hypervisor().set_shadow_multiplier(domid, multiplier).await?;
            }
            svc.store().update_vm(&vm_id, |vm| {
                vm.config.shadow_multiplier = multiplier;
                vm.state.shadow_multiplier_target = multiplier;
            })?;
            Ok(None)
        })
    }

    /// Merge `data` into the VM's guest store data.
    #[instrument(skip(self, data))]
    pub fn set_xsdata(&self, dbg: &str, id: &str, data: BTreeMap<String, String>) -> Result<String> {
        let vm_id = id.to_string();
        self.submit_vm_task(dbg, "VM.set_xsdata", id, VmOp::SetXsdata, move |svc, _ctx| async move {
            if let Some(domid) = svc.store().vm(&vm_id)?.state.domid() {
                svc.hypervisor().write_xsdata(domid, &data).await?;
            }
            svc.store()
                .update_vm(&vm_id, |vm| vm.config.xsdata.extend(data))?;
            Ok(None)
        })
    }
}
