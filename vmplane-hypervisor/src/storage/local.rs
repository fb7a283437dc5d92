//! Local directory storage backend.
//!
//! `DiskRef::Local` paths are used as they are. `DiskRef::Vdi { sr, vdi }`
//! resolves to `<base>/<sr>/<vdi>`; a repository directory is treated as
//! read-only when its permissions say so.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::traits::{AttachInfo, StorageBackend};
use crate::error::{HypervisorError, Result};
use crate::types::DiskRef;

/// Default base path for storage repositories.
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/vmplane/sr";

/// Local directory storage backend.
pub struct LocalBackend {
    /// Base path for storage repositories
    base_path: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend with the default path.
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_STORAGE_PATH),
        }
    }

    /// Create a local backend with a custom base path.
    pub fn with_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Get the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, disk: &DiskRef) -> PathBuf {
        match disk {
            DiskRef::Local(path) => PathBuf::from(path),
            DiskRef::Vdi { sr, vdi } => self.base_path.join(sr).join(vdi),
        }
    }

    fn error(&self, message: String) -> HypervisorError {
        HypervisorError::Storage {
            backend: self.name().to_string(),
            messages: vec![message],
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip(self), fields(disk = %disk))]
    async fn attach(&self, dbg: &str, disk: &DiskRef, writable: bool) -> Result<AttachInfo> {
        let path = self.resolve(disk);

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| self.error(format!("Cannot access {}: {}", path.display(), e)))?;

        let mut read_only = metadata.permissions().readonly();
        if let DiskRef::Vdi { sr, .. } = disk {
            let sr_meta = tokio::fs::metadata(self.base_path.join(sr))
                .await
                .map_err(|e| self.error(format!("Storage repository {} unavailable: {}", sr, e)))?;
            read_only |= sr_meta.permissions().readonly();
        }

        if writable && read_only {
            return Err(self.error(format!("{} is read-only", path.display())));
        }

        info!(path = %path.display(), read_only, "Disk attached");
        Ok(AttachInfo {
            path: path.to_string_lossy().into_owned(),
            read_only,
        })
    }

    #[instrument(skip(self), fields(disk = %disk))]
    async fn detach(&self, dbg: &str, disk: &DiskRef) -> Result<()> {
        debug!("Nothing to release for local disk");
        Ok(())
    }
}
