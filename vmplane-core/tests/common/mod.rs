//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vmplane_core::{Error, NodeService, ServiceConfig, TaskInfo, TaskState};
use vmplane_hypervisor::{BootMethod, MockBackend, MockStorage, PvBoot, VmConfig};

pub const DBG: &str = "test";

pub struct Harness {
    pub service: NodeService,
    pub backend: Arc<MockBackend>,
    pub storage: Arc<MockStorage>,
}

pub fn harness() -> Harness {
    harness_with(MockBackend::new(), ServiceConfig::default())
}

pub fn harness_with(backend: MockBackend, config: ServiceConfig) -> Harness {
    let backend = Arc::new(backend);
    let storage = Arc::new(MockStorage::new());
    let service = NodeService::new(config, backend.clone(), storage.clone());
    Harness {
        service,
        backend,
        storage,
    }
}

/// A direct-kernel PV guest with a 256..512 MiB balloon range under a
/// 1 GiB ceiling.
pub fn pv_vm(id: &str) -> VmConfig {
    VmConfig::new(
        id,
        id,
        BootMethod::Pv(PvBoot::Direct {
            kernel: "/boot/vmlinuz".to_string(),
            cmdline: "console=hvc0".to_string(),
            ramdisk: None,
        }),
    )
    .with_memory(256, 512, 1024)
    .with_vcpus(1, 4)
}

/// Wait for a task to finish.
pub async fn wait(service: &NodeService, task: &str) -> TaskInfo {
    let info = service.wait_task(task, Duration::from_secs(10)).await.unwrap();
    assert!(info.state.is_terminal(), "task {} did not finish: {:?}", task, info.state);
    info
}

/// Wait for a task and assert that it completed.
pub async fn completed(service: &NodeService, task: &str) -> TaskInfo {
    let info = wait(service, task).await;
    assert!(
        matches!(info.state, TaskState::Completed { .. }),
        "task {} ({}) failed: {:?}",
        task,
        info.name,
        info.state
    );
    info
}

/// Wait for a task and return the error it failed with.
pub async fn failed(service: &NodeService, task: &str) -> Error {
    match wait(service, task).await.state {
        TaskState::Failed { error, .. } => error,
        other => panic!("task {} did not fail: {:?}", task, other),
    }
}

/// Add a PV VM and start it.
pub async fn running_vm(service: &NodeService, id: &str) {
    service.add_vm(DBG, pv_vm(id)).unwrap();
    let task = service.start_vm(DBG, id).unwrap();
    completed(service, &task).await;
}
