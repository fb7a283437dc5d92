//! Storage backend trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::DiskRef;

/// Result of attaching a disk on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachInfo {
    /// Host path the hypervisor should use for the device
    pub path: String,
    /// Whether the disk can only be attached read-only
    pub read_only: bool,
}

/// Storage backend trait.
///
/// Resolves a disk reference to something the hypervisor can attach. The
/// control plane calls `attach` before a Vbd is plugged and `detach` after
/// it is unplugged.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name, reported in storage errors.
    fn name(&self) -> &str;

    /// Make the disk available on this host.
    ///
    /// Fails when `writable` is requested for a disk that can only be
    /// attached read-only.
    async fn attach(&self, dbg: &str, disk: &DiskRef, writable: bool) -> Result<AttachInfo>;

    /// Release a disk previously attached.
    async fn detach(&self, dbg: &str, disk: &DiskRef) -> Result<()>;
}
