//! Task engine scenarios driven through the service.

mod common;

use std::time::Duration;

use common::*;
use vmplane_core::{Error, PowerState, ServiceConfig, TaskState};
use vmplane_hypervisor::{MigrateOptions, MockBackend};

/// Test that a finished task ignores cancellation.
#[tokio::test]
async fn test_terminal_state_is_final() {
    let h = harness();
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();
    let task = h.service.start_vm(DBG, "vm1").unwrap();
    let done = completed(&h.service, &task).await;

    h.service.cancel_task(DBG, &task).unwrap();
    h.service.cancel_task(DBG, &task).unwrap();

    let info = h.service.stat_task(&task).unwrap();
    assert_eq!(info.state, done.state);
    assert!(!info.cancel_requested);
}

/// Test that a running task cannot be destroyed.
#[tokio::test]
async fn test_destroy_requires_terminal_state() {
    let backend = MockBackend::new();
    backend.set_delay("create_domain", Duration::from_millis(300));
    let h = harness_with(backend, ServiceConfig::default());
    h.service.add_vm(DBG, pv_vm("vm1")).unwrap();

    let task = h.service.start_vm(DBG, "vm1").unwrap();
    assert_eq!(
        h.service.destroy_task(DBG, &task).unwrap_err(),
        Error::TaskInProgress { task: task.clone() }
    );

    completed(&h.service, &task).await;
    h.service.destroy_task(DBG, &task).unwrap();
    assert!(matches!(
        h.service.stat_task(&task),
        Err(Error::DoesNotExist { .. })
    ));
    assert!(!h.service.list_tasks().iter().any(|t| t.id == task));
}

/// Test cancelling a migration while it is copying memory.
#[tokio::test]
async fn test_cancel_running_migration() {
    let backend = MockBackend::new();
    backend.set_delay("migrate_domain", Duration::from_secs(5));
    let h = harness_with(backend, ServiceConfig::default());
    running_vm(&h.service, "vm1").await;

    let task = h
        .service
        .migrate_vm(DBG, "vm1", "host-b", MigrateOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.service.cancel_task(DBG, &task).unwrap();

    let info = h.service.wait_task(&task, Duration::from_secs(2)).await.unwrap();
    assert!(info.cancel_requested);
    match info.state {
        TaskState::Failed { error, .. } => assert_eq!(error, Error::Cancelled { task: task.clone() }),
        other => panic!("expected cancellation, got {:?}", other),
    }

    let vm = h.service.stat_vm("vm1").unwrap();
    assert_eq!(vm.state.power_state, PowerState::Running);
    assert_eq!(h.backend.domain_count(), 1);
}

/// Test that tasks on one VM run in submission order.
#[tokio::test]
async fn test_per_vm_ordering() {
    let backend = MockBackend::new();
    backend.set_delay("pause_domain", Duration::from_millis(100));
    let h = harness_with(backend, ServiceConfig::default());
    running_vm(&h.service, "vm1").await;

    let pause = h.service.pause_vm(DBG, "vm1").unwrap();
    // Admitted against the current state, re-checked once the pause is done
    let second_pause = h.service.pause_vm(DBG, "vm1").unwrap();

    completed(&h.service, &pause).await;
    assert!(matches!(
        failed(&h.service, &second_pause).await,
        Error::BadPowerState {
            actual: PowerState::Paused,
            ..
        }
    ));
}

/// Test resizing the worker pool.
#[tokio::test]
async fn test_worker_pool_size() {
    let h = harness_with(MockBackend::new(), ServiceConfig::default().with_worker_pool_size(2));
    assert_eq!(h.service.host_stat().await.unwrap().worker_pool_size, 2);

    assert!(matches!(
        h.service.set_worker_pool_size(DBG, 0),
        Err(Error::InvalidArgument { .. })
    ));

    h.service.set_worker_pool_size(DBG, 4).unwrap();
    assert_eq!(h.service.host_stat().await.unwrap().worker_pool_size, 4);

    h.service.set_worker_pool_size(DBG, 1).unwrap();
    running_vm(&h.service, "vm1").await;
}

/// Test that subtasks are recorded on the task in order.
#[tokio::test]
async fn test_subtasks_recorded() {
    let h = harness();
    running_vm(&h.service, "vm1").await;

    let task = h.service.shutdown_vm(DBG, "vm1", Some(Duration::from_secs(1))).unwrap();
    let info = completed(&h.service, &task).await;
    assert_eq!(info.name, "VM.shutdown");
    assert_eq!(info.dbg, DBG);
    let names: Vec<&str> = info.subtasks.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"VM.destroy"));
    assert!(info.subtasks.iter().all(|s| s.state.is_terminal()));
}

#[cfg(unix)]
mod hooks {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Test that a failing pre-start hook stops the VM from starting.
    #[tokio::test]
    async fn test_pre_start_hook_failure() {
        let dir = tempfile::tempdir().unwrap();
        let hook_dir = dir.path().join("vm-pre-start");
        std::fs::create_dir(&hook_dir).unwrap();
        let script = hook_dir.join("10-deny");
        std::fs::write(&script, "#!/bin/sh\necho denied >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let h = harness_with(MockBackend::new(), ServiceConfig::default().with_hooks_dir(dir.path()));
        h.service.add_vm(DBG, pv_vm("vm1")).unwrap();

        let task = h.service.start_vm(DBG, "vm1").unwrap();
        match failed(&h.service, &task).await {
            Error::HookFailed { stderr, .. } => assert_eq!(stderr.trim(), "denied"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.service.stat_vm("vm1").unwrap().state.power_state, PowerState::Halted);
        assert_eq!(h.backend.domain_count(), 0);
    }
}
