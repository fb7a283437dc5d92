//! Storage backends.
//!
//! A storage backend turns a [`DiskRef`](crate::types::DiskRef) into a host
//! path that can be handed to the hypervisor:
//! - **Local**: plain files and block devices under a base directory
//! - **Mock**: in-memory repositories with fault injection, for tests

mod local;
mod mock;
mod traits;

pub use local::*;
pub use mock::*;
pub use traits::*;
