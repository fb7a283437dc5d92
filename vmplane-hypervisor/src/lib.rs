//! # vmplane Hypervisor
//!
//! Collaborator interfaces the vmplane control plane drives, and the
//! configuration types they exchange.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            vmplane-core                 │
//! │   (validator, task engine, updates)     │
//! └──────────┬───────────────────┬──────────┘
//!            ▼                   ▼
//! ┌───────────────────┐ ┌───────────────────┐
//! │  Hypervisor trait │ │ StorageBackend    │
//! │ (domains/devices) │ │ (DiskRef -> path) │
//! └───────────────────┘ └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmplane_hypervisor::{BootMethod, HvmBoot, Hypervisor, MockBackend, VmConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::new();
//!     let config = VmConfig::new("vm-1", "my-vm", BootMethod::Hvm(HvmBoot::default()))
//!         .with_vcpus(2, 4)
//!         .with_memory(512, 1024, 2048);
//!
//!     let domid = backend.create_domain(&config).await.unwrap();
//!     backend.build_domain(domid, &config, None).await.unwrap();
//! }
//! ```

pub mod error;
pub mod mock;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::HypervisorError;
pub use mock::MockBackend;
pub use storage::{AttachInfo, LocalBackend, MockStorage, StorageBackend, DEFAULT_STORAGE_PATH};
pub use traits::{Hypervisor, HypervisorCapabilities};
pub use types::*;
