//! The operation catalog.
//!
//! [`NodeService`] is the single entry point for every VM, device, task,
//! update-feed and host operation. Mutating VM and device operations are
//! checked against the state machines before a task is created; a rejected
//! call returns an error and leaves no trace. Admitted operations run as
//! tasks queued per VM and are checked again when their turn comes.
//!
//! ```text
//! ┌──────────────┐   submit    ┌─────────────┐   acquire   ┌──────────────┐
//! │ NodeService  │────────────►│ TaskManager │────────────►│ worker pool  │
//! │ (validator)  │             │ (per-VM     │             │ (Semaphore)  │
//! └──────┬───────┘             │  queues)    │             └──────┬───────┘
//!        │ stat / list         └─────────────┘                    │
//!        ▼                                                        ▼
//! ┌──────────────┐   publish   ┌─────────────┐             ┌──────────────┐
//! │    Store     │────────────►│   Updates   │             │  Hypervisor  │
//! └──────────────┘             └─────────────┘             │  Storage     │
//!                                                          └──────────────┘
//! ```

mod device;
mod events;
mod hooks;
mod host;
mod task;
mod updates;
mod vm;

pub use host::{mask_features, HostStat};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use vmplane_hypervisor::{DomId, Hypervisor, StorageBackend};

use crate::error::{Error, Result};
use crate::model::{PowerState, Vm};
use crate::store::Store;
use crate::task::{TaskContext, TaskManager, DEFAULT_WORKER_POOL_SIZE};
use crate::updates::{Updates, DEFAULT_FEED_CAPACITY};
use crate::validator::{self, VmOp};

/// Default location for core dumps written by the `coredump` crash action.
pub const DEFAULT_DUMP_DIR: &str = "/var/crash/vmplane";

/// Service configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name this instance answers to
    pub queue_name: String,
    /// Number of tasks that may execute at once
    pub worker_pool_size: usize,
    /// Maximum number of entries retained by the update feed
    pub feed_capacity: usize,
    /// Root of the lifecycle hook script directories
    pub hooks_dir: Option<PathBuf>,
    /// Where crash dumps are written
    pub dump_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_name: "org.vmplane.node".to_string(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            hooks_dir: None,
            dump_dir: PathBuf::from(DEFAULT_DUMP_DIR),
        }
    }
}

impl ServiceConfig {
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }

    pub fn with_hooks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hooks_dir = Some(dir.into());
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }
}

struct Inner {
    config: ServiceConfig,
    hypervisor: Arc<dyn Hypervisor>,
    storage: Arc<dyn StorageBackend>,
    updates: Arc<Updates>,
    store: Store,
    tasks: TaskManager,
}

/// Host-level VM control plane.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct NodeService {
    inner: Arc<Inner>,
}

impl NodeService {
    /// Create a service driving `hypervisor` and `storage`.
    pub fn new(config: ServiceConfig, hypervisor: Arc<dyn Hypervisor>, storage: Arc<dyn StorageBackend>) -> Self {
        let updates = Arc::new(Updates::new(config.feed_capacity));
        let store = Store::new(updates.clone());
        let tasks = TaskManager::new(config.worker_pool_size, updates.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                hypervisor,
                storage,
                updates,
                store,
                tasks,
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    fn hypervisor(&self) -> &dyn Hypervisor {
        self.inner.hypervisor.as_ref()
    }

    fn storage(&self) -> &dyn StorageBackend {
        self.inner.storage.as_ref()
    }

    fn store(&self) -> &Store {
        &self.inner.store
    }

    fn feed(&self) -> &Updates {
        &self.inner.updates
    }

    fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    /// Admit a VM operation and run `body` as a task queued on the VM.
    ///
    /// The operation is checked now, so a rejected call creates no task,
    /// and again when the task gets its turn.
    fn submit_vm_task<F, Fut>(&self, dbg: &str, name: &str, vm_id: &str, op: VmOp, body: F) -> Result<String>
    where
        F: FnOnce(NodeService, TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let vm = self.store().vm(vm_id)?;
        validator::check_vm_op(&vm.config, &vm.state, &op)?;

        let svc = self.clone();
        let queued_id = vm_id.to_string();
        let task = self.tasks().submit(dbg, name, Some(vm_id), move |ctx| async move {
            let vm = svc.store().vm(&queued_id)?;
            validator::check_vm_op(&vm.config, &vm.state, &op)?;
            body(svc, ctx).await
        });
        Ok(task)
    }
}

/// The VM's current domain, or `BadPowerState` if it has none.
fn domid_of(vm: &Vm) -> Result<DomId> {
    vm.state
        .domid()
        .ok_or_else(|| Error::bad_power_state(&[PowerState::Running, PowerState::Paused], vm.state.power_state))
}
