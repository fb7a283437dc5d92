//! VM power-cycle scenarios against the mock hypervisor.

mod common;

use std::time::Duration;

use common::*;
use vmplane_core::{DynamicValue, Error, FeedEntry, PowerState, ServiceConfig, TaskState};
use vmplane_hypervisor::{
    BootMethod, DiskRef, DomainEvent, DomainEventKind, HostCpuInfo, HvmBoot, HypervisorError, LifecycleAction,
    MigrateOptions, MockBackend, PvBoot, ShutdownReason, VbdConfig, VmConfig,
};

/// Test that an illegal operation is rejected without creating a task or
/// touching the feed.
#[tokio::test]
async fn test_pause_halted_vm_is_rejected_synchronously() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();
    let last = h.service.last_update_id();

    let err = h.service.pause_vm(DBG, "vm1").unwrap_err();
    assert_eq!(
        err,
        Error::BadPowerState {
            expected: vec![PowerState::Running],
            actual: PowerState::Halted,
        }
    );
    assert!(h.service.list_tasks().is_empty());
    assert_eq!(h.service.last_update_id(), last);
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Halted);
}

/// Test a full start, recording each step as a sub-task.
#[tokio::test]
async fn test_start_runs_every_step() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();

    let task = h.service.start_vm(DBG, "vm1").unwrap();
    let info = completed(&h.service, &task).await;

    let names: Vec<&str> = info.subtasks.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["VM.create", "VM.build", "VM.create_device_model", "VM.unpause"]
    );
    assert!(info
        .subtasks
        .iter()
        .all(|s| matches!(s.state, TaskState::Completed { .. })));

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Running);
    assert!(vm.state.built);
    assert!(vm.state.device_model_running);
    assert!(vm.state.last_start_time.is_some());
    assert_eq!(vm.state.memory_actual_mib, 512);
    assert_eq!(h.backend.domid_of("vm1"), vm.state.domid());
    assert!(!vm.state.consoles.is_empty());
}

/// Test that by the time a watcher sees the VM Running on the feed, a stat
/// agrees.
#[tokio::test]
async fn test_feed_never_runs_ahead_of_stat() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();
    let mut from = h.service.last_update_id();

    let task = h.service.start_vm(DBG, "vm1").unwrap();

    let mut seen_running = false;
    while !seen_running {
        let batch = h.service.get_updates(from, Duration::from_secs(5)).await;
        assert!(!batch.entries.is_empty(), "feed went quiet before the VM ran");
        for entry in &batch.entries {
            if let FeedEntry::Update {
                value: Some(DynamicValue::Vm(vm)),
                ..
            } = &entry.entry
            {
                if vm.state.power_state == PowerState::Running {
                    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Running);
                    seen_running = true;
                }
            }
        }
        from = batch.last_id;
    }
    completed(&h.service, &task).await;
}

/// Test that a start that cannot fit in host memory fails.
#[tokio::test]
async fn test_start_without_memory_fails() {
    let h = harness_with(
        MockBackend::new().with_host(HostCpuInfo::default(), 512),
        ServiceConfig::default(),
    );
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();

    let task = h.service.start_vm(DBG, "vm1").unwrap();
    assert_eq!(
        failed(&h.service, &task).await,
        Error::InsufficientMemory {
            needed_mib: 1024,
            free_mib: 512,
        }
    );
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Halted);
}

/// Test boot disk selection for HVM guests.
#[tokio::test]
async fn test_hvm_start_needs_a_boot_device() {
    let h = harness();
    let config = VmConfig::new("disky", "disky", BootMethod::Hvm(HvmBoot::default()));
    h.service.add_vm(DBG, config).unwrap();

    let task = h.service.start_vm(DBG, "disky").unwrap();
    assert_eq!(failed(&h.service, &task).await, Error::NoBootableDevice);

    let netboot = HvmBoot {
        boot_order: "n".to_string(),
        ..HvmBoot::default()
    };
    h.service
        .add_vm(DBG, VmConfig::new("pxe", "pxe", BootMethod::Hvm(netboot)))
        .unwrap();
    let task = h.service.start_vm(DBG, "pxe").unwrap();
    completed(&h.service, &task).await;
}

/// Test that a bootloader guest boots from its disk and keeps it attached.
#[tokio::test]
async fn test_bootloader_guest_uses_its_disk() {
    let h = harness();
    let config = VmConfig::new(
        "pv",
        "pv",
        BootMethod::Pv(PvBoot::Indirect {
            bootloader: "pygrub".to_string(),
            extra_args: String::new(),
            legacy_args: String::new(),
            bootloader_args: String::new(),
            devices: Vec::new(),
        }),
    );
    h.service.add_vm(DBG, config).unwrap();
    let root = DiskRef::Local("/images/pv-root.img".to_string());
    h.service
        .add_vbd(DBG, VbdConfig::disk("pv", "xvda", root.clone()))
        .unwrap();

    let task = h.service.start_vm(DBG, "pv").unwrap();
    let info = completed(&h.service, &task).await;
    assert!(info.subtasks.iter().any(|s| s.name == "VBD.plug xvda"));

    let domid = h.service.stat_vm("pv").unwrap().state.domid().unwrap();
    assert_eq!(h.backend.attached_vbds(domid), vec!["xvda".to_string()]);
    assert!(h.storage.is_attached(&root));
}

/// Test clean shutdown, and the timeout when the guest ignores it.
#[tokio::test]
async fn test_shutdown_deadline() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let domid = h.service.stat_vm("vm1").unwrap().state.domid().unwrap();
    h.backend.set_unresponsive(domid);

    let task = h
        .service
        .shutdown_vm(DBG, "vm1", Some(Duration::from_millis(100)))
        .unwrap();
    match failed(&h.service, &task).await {
        Error::ShutdownTimeout { elapsed_secs } => assert!(elapsed_secs >= 0.1),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Running);

    let task = h.service.shutdown_vm(DBG, "vm1", None).unwrap();
    completed(&h.service, &task).await;

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Halted);
    assert!(vm.state.domids.is_empty());
    assert!(vm.state.consoles.is_empty());
    assert_eq!(h.backend.domain_count(), 0);
}

/// Test that a reboot ends with the VM running in a new domain.
#[tokio::test]
async fn test_reboot_replaces_the_domain() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let before = h.service.stat_vm("vm1").unwrap().state.domid().unwrap();

    let task = h
        .service
        .reboot_vm(DBG, "vm1", Some(Duration::from_secs(1)))
        .unwrap();
    completed(&h.service, &task).await;

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Running);
    assert_ne!(vm.state.domid(), Some(before));
    assert_eq!(h.backend.domain_count(), 1);
}

/// Test pause and unpause.
#[tokio::test]
async fn test_pause_and_unpause() {
    let h = harness();
    running_vm(&h.service, "vm1").await;

    let task = h.service.pause_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Paused);

    assert!(matches!(
        h.service.pause_vm(DBG, "vm1"),
        Err(Error::BadPowerState { .. })
    ));

    let task = h.service.unpause_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Running);
}

/// Test a suspend to disk and a resume from the same image.
#[tokio::test]
async fn test_suspend_and_resume() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();
    let data = h
        .service
        .add_vbd(DBG, VbdConfig::disk("vm1", "xvdb", DiskRef::Local("/images/data.img".into())))
        .unwrap();
    let task = h.service.start_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;

    let image = DiskRef::Local("/var/lib/vmplane/suspend/vm1.img".to_string());
    let task = h.service.suspend_vm(DBG, "vm1", image.clone()).unwrap();
    completed(&h.service, &task).await;

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Suspended);
    assert_eq!(vm.state.suspend_image, Some(image.clone()));
    assert!(vm.state.domids.is_empty());
    assert!(!h.service.stat_vbd(&data).unwrap().state.status.plugged);
    assert!(!h.storage.is_attached(&image));

    let task = h.service.resume_vm(DBG, "vm1", image).unwrap();
    completed(&h.service, &task).await;

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Running);
    assert_eq!(vm.state.suspend_image, None);
    assert!(h.service.stat_vbd(&data).unwrap().state.status.plugged);
}

/// Test that shutting down a suspended VM discards its image.
#[tokio::test]
async fn test_shutdown_suspended_vm() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let task = h
        .service
        .suspend_vm(DBG, "vm1", DiskRef::Local("/tmp/vm1.img".into()))
        .unwrap();
    completed(&h.service, &task).await;

    let task = h.service.shutdown_vm(DBG, "vm1", None).unwrap();
    completed(&h.service, &task).await;

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Halted);
    assert_eq!(vm.state.suspend_image, None);
}

/// Test that rebooting a suspended VM discards its image and boots afresh.
#[tokio::test]
async fn test_reboot_suspended_vm() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let image = DiskRef::Local("/tmp/vm1.img".to_string());
    let task = h.service.suspend_vm(DBG, "vm1", image.clone()).unwrap();
    completed(&h.service, &task).await;

    let task = h
        .service
        .reboot_vm(DBG, "vm1", Some(Duration::from_secs(1)))
        .unwrap();
    let info = completed(&h.service, &task).await;
    assert!(!info.subtasks.iter().any(|s| s.name == "VM.shutdown"));

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Running);
    assert_eq!(vm.state.suspend_image, None);
    assert_eq!(h.backend.domain_count(), 1);
    assert!(!h.storage.is_attached(&image));
}

/// Test that a migrated VM disappears from this host.
#[tokio::test]
async fn test_migrate_removes_the_vm() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let vbd = h
        .service
        .add_vbd(DBG, VbdConfig::disk("vm1", "xvdb", DiskRef::Local("/images/b.img".into())))
        .unwrap();

    let task = h
        .service
        .migrate_vm(DBG, "vm1", "", MigrateOptions::default())
        .unwrap();
    assert!(matches!(
        failed(&h.service, &task).await,
        Error::RemoteUnreachable { .. }
    ));
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Running);

    let options = MigrateOptions {
        live: true,
        ..MigrateOptions::default()
    };
    let task = h.service.migrate_vm(DBG, "vm1", "host-b", options).unwrap();
    let info = completed(&h.service, &task).await;
    match info.state {
        TaskState::Completed { result, .. } => {
            assert_eq!(result, Some(serde_json::json!({ "destination": "host-b" })));
        }
        other => panic!("unexpected state: {:?}", other),
    }

    assert!(!h.service.vm_exists("vm1"));
    assert!(matches!(h.service.stat_vbd(&vbd), Err(Error::DoesNotExist { .. })));
    assert_eq!(h.backend.domain_count(), 0);
}

/// Test removal of halted and running VMs.
#[tokio::test]
async fn test_remove_requires_halted() {
    let h = harness();
    running_vm(&h.service, "vm1").await;

    assert!(matches!(
        h.service.remove_vm(DBG, "vm1"),
        Err(Error::BadPowerState { .. })
    ));

    let task = h.service.shutdown_vm(DBG, "vm1", None).unwrap();
    completed(&h.service, &task).await;
    h.service.remove_vm(DBG, "vm1").unwrap();
    assert!(!h.service.vm_exists("vm1"));
    assert!(matches!(
        h.service.remove_vm(DBG, "vm1"),
        Err(Error::DoesNotExist { .. })
    ));
}

/// Test that a VM cannot be removed while its start is still in flight.
#[tokio::test]
async fn test_remove_waits_for_queued_start() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();
    h.backend.set_delay("create_domain", Duration::from_millis(200));

    let task = h.service.start_vm(DBG, "vm1").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.service.remove_vm(DBG, "vm1").unwrap_err(),
        Error::TaskInProgress { task: task.clone() }
    );

    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Running);
    assert_eq!(h.backend.domain_count(), 1);

    let task = h.service.shutdown_vm(DBG, "vm1", None).unwrap();
    completed(&h.service, &task).await;
    h.service.remove_vm(DBG, "vm1").unwrap();
    assert!(!h.service.vm_exists("vm1"));
}

/// Test that low-level steps enforce their order.
#[tokio::test]
async fn test_low_level_steps() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();

    assert!(matches!(
        h.service.build_vm(DBG, "vm1"),
        Err(Error::BadPowerState { .. })
    ));

    let task = h.service.create_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Paused);
    assert!(!vm.state.built);

    assert_eq!(
        h.service.create_device_model(DBG, "vm1").unwrap_err(),
        Error::DomainNotBuilt { vm: "vm1".to_string() }
    );
    assert_eq!(
        h.service.unpause_vm(DBG, "vm1").unwrap_err(),
        Error::DomainNotBuilt { vm: "vm1".to_string() }
    );

    let task = h.service.build_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    let task = h.service.create_device_model(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    let task = h.service.unpause_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Running);

    let task = h.service.destroy_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Halted);
    assert_eq!(h.backend.domain_count(), 0);
}

/// Test runtime tuning admission rules.
#[tokio::test]
async fn test_memory_and_vcpu_bounds() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();

    let task = h
        .service
        .set_memory_dynamic_range(DBG, "vm1", 128, 1024)
        .unwrap();
    completed(&h.service, &task).await;
    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.config.memory.dynamic_min_mib, 128);
    assert_eq!(vm.config.memory.dynamic_max_mib, 1024);
    assert_eq!(vm.state.memory_target_mib, 1024);

    assert_eq!(
        h.service
            .set_memory_dynamic_range(DBG, "vm1", 2048, 4096)
            .unwrap_err(),
        Error::InvalidMemoryRange {
            min_mib: 2048,
            max_mib: 4096,
            static_max_mib: 1024,
        }
    );

    assert_eq!(
        h.service.set_vcpus(DBG, "vm1", 0).unwrap_err(),
        Error::InvalidVcpus { requested: 0, max: 4 }
    );
    assert!(matches!(
        h.service.set_vcpus(DBG, "vm1", 5),
        Err(Error::InvalidVcpus { .. })
    ));
    let task = h.service.set_vcpus(DBG, "vm1", 3).unwrap();
    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.vcpu_target, 3);

    assert!(matches!(
        h.service.set_shadow_multiplier(DBG, "vm1", 2.0),
        Err(Error::Unimplemented { .. })
    ));
}

/// Test that balloon growth the host cannot cover is refused.
#[tokio::test]
async fn test_memory_growth_shortfall() {
    let h = harness_with(
        MockBackend::new().with_host(HostCpuInfo::default(), 2048),
        ServiceConfig::default(),
    );
    running_vm(&h.service, "vm1").await;
    let hog = pv_vm("hog").with_memory(1280, 1280, 1280);
    h.service.add_vm(DBG, hog).unwrap();
    let task = h.service.start_vm(DBG, "hog").unwrap();
    completed(&h.service, &task).await;

    // 2048 - 512 - 1280 = 256 MiB free, growth of 512 requested
    let task = h
        .service
        .set_memory_dynamic_range(DBG, "vm1", 256, 1024)
        .unwrap();
    assert_eq!(
        failed(&h.service, &task).await,
        Error::MemoryShortfall { shortfall_mib: 256 }
    );
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.memory_target_mib, 512);
}

/// Test that uncooperative domains are reported by VM.
#[tokio::test]
async fn test_ballooning_failure_names_vms() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let domid = h.service.stat_vm("vm1").unwrap().state.domid().unwrap();
    h.backend.inject_failure(
        "set_memory_target",
        HypervisorError::BallooningFailed {
            uncooperative: vec![domid, 999],
        },
    );

    let task = h
        .service
        .set_memory_dynamic_range(DBG, "vm1", 256, 384)
        .unwrap();
    assert_eq!(
        failed(&h.service, &task).await,
        Error::BallooningFailed {
            uncooperative: vec!["vm1".to_string(), "domid 999".to_string()],
        }
    );
}

/// Test guest store data is merged into the configuration.
#[tokio::test]
async fn test_set_xsdata_merges() {
    let h = harness();
    running_vm(&h.service, "vm1").await;

    let data = [("vm-data/role".to_string(), "web".to_string())].into_iter().collect();
    let task = h.service.set_xsdata(DBG, "vm1", data).unwrap();
    completed(&h.service, &task).await;
    let data = [("vm-data/tier".to_string(), "1".to_string())].into_iter().collect();
    let task = h.service.set_xsdata(DBG, "vm1", data).unwrap();
    completed(&h.service, &task).await;

    let xsdata = h.service.stat_vm("vm1").unwrap().config.xsdata;
    assert_eq!(xsdata.len(), 2);
    assert_eq!(xsdata["vm-data/role"], "web");
}

/// Test the configured reaction to a guest crashing or halting itself.
#[tokio::test]
async fn test_domain_events_apply_lifecycle_actions() {
    let h = harness();
    running_vm(&h.service, "vm1").await;
    let first = h.service.stat_vm("vm1").unwrap().state.domid().unwrap();

    let task = h
        .service
        .handle_domain_event(DomainEvent {
            domid: first,
            kind: DomainEventKind::Shutdown(ShutdownReason::Crash),
        })
        .unwrap()
        .unwrap();
    completed(&h.service, &task).await;
    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Running);
    let second = vm.state.domid().unwrap();
    assert_ne!(second, first);

    // The old domain is gone, so a late duplicate is ignored
    assert_eq!(
        h.service
            .handle_domain_event(DomainEvent {
                domid: first,
                kind: DomainEventKind::Shutdown(ShutdownReason::Crash),
            })
            .unwrap(),
        None
    );

    let task = h
        .service
        .handle_domain_event(DomainEvent {
            domid: second,
            kind: DomainEventKind::Shutdown(ShutdownReason::Halt),
        })
        .unwrap()
        .unwrap();
    completed(&h.service, &task).await;
    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Halted);
}

/// Test the coredump crash action.
#[tokio::test]
async fn test_crash_with_coredump() {
    let h = harness_with(MockBackend::new(), ServiceConfig::default().with_dump_dir("/tmp/dumps"));
    let config = pv_vm("vm1").with_on_crash(LifecycleAction::Coredump);
    h.service.add_vm(DBG, config).unwrap();
    let task = h.service.start_vm(DBG, "vm1").unwrap();
    completed(&h.service, &task).await;
    let domid = h.service.stat_vm("vm1").unwrap().state.domid().unwrap();

    let task = h
        .service
        .handle_domain_event(DomainEvent {
            domid,
            kind: DomainEventKind::Shutdown(ShutdownReason::Crash),
        })
        .unwrap()
        .unwrap();
    completed(&h.service, &task).await;

    assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Halted);
    let console = h.service.get_console_data().await.unwrap();
    assert!(console.contains(&format!("/tmp/dumps/vm1-{}.core", domid)));
}

/// Test metadata export and import.
#[tokio::test]
async fn test_metadata_round_trip() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();
    h.service
        .add_vbd(DBG, VbdConfig::disk("vm1", "xvda", DiskRef::Local("/images/a.img".into())))
        .unwrap();

    let exported = h.service.export_metadata("vm1").unwrap();
    assert!(matches!(
        h.service.import_metadata(DBG, &exported),
        Err(Error::AlreadyExists { .. })
    ));

    h.service.remove_vm(DBG, "vm1").unwrap();
    assert_eq!(h.service.import_metadata(DBG, &exported).unwrap(), "vm1");
    assert_eq!(h.service.list_vbds("vm1").unwrap().len(), 1);
    assert_eq!(h.service.export_metadata("vm1").unwrap(), exported);

    let foreign = exported.replace("\"vm\": \"vm1\"", "\"vm\": \"other\"");
    h.service.remove_vm(DBG, "vm1").unwrap();
    assert!(matches!(
        h.service.import_metadata(DBG, &foreign),
        Err(Error::InvalidArgument { .. })
    ));
    assert!(!h.service.vm_exists("vm1"));
}
