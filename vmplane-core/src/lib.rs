//! # vmplane Core
//!
//! Host-level VM control plane: the object model, the power and device
//! state machines, the task engine, the update feed and the operation
//! catalog that ties them together.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vmplane_core::{NodeService, ServiceConfig};
//! use vmplane_hypervisor::{BootMethod, HvmBoot, MockBackend, MockStorage, VmConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = NodeService::new(
//!         ServiceConfig::default(),
//!         Arc::new(MockBackend::new()),
//!         Arc::new(MockStorage::new()),
//!     );
//!
//!     let config = VmConfig::new("vm-1", "web", BootMethod::Hvm(HvmBoot::default()));
//!     service.add_vm("cli", config).unwrap();
//!
//!     let task = service.start_vm("cli", "vm-1").unwrap();
//!     let info = service.wait_task(&task, Duration::from_secs(10)).await.unwrap();
//!     println!("{:?}", info.state);
//! }
//! ```

pub mod error;
pub mod model;
pub mod service;
pub mod task;
pub mod updates;
pub mod validator;

mod store;

pub use error::{Error, Result};
pub use model::{
    DeviceRef, DeviceStatus, DynamicId, DynamicValue, ObjectKind, Pci, PciState, PowerState, SubTask, TaskInfo,
    TaskState, Vbd, VbdState, Vif, VifState, Vm, VmMetadata, VmState,
};
pub use service::{mask_features, HostStat, NodeService, ServiceConfig, DEFAULT_DUMP_DIR};
pub use task::{TaskContext, TaskManager, DEFAULT_WORKER_POOL_SIZE};
pub use updates::{Barrier, FeedBatch, FeedEntry, SequencedEntry, Updates, DEFAULT_FEED_CAPACITY};
