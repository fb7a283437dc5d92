//! In-memory storage backend for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::traits::{AttachInfo, StorageBackend};
use crate::error::{HypervisorError, Result};
use crate::types::DiskRef;

/// Mock storage backend.
///
/// Local paths always attach read-write. Vdis attach only from repositories
/// registered with [`MockStorage::add_sr`].
pub struct MockStorage {
    state: RwLock<MockStorageState>,
}

#[derive(Default)]
struct MockStorageState {
    /// Repository name -> read-only flag
    srs: HashMap<String, bool>,
    attached: HashSet<DiskRef>,
    fail_next_attach: Option<String>,
}

impl MockStorage {
    /// Create a mock storage backend with no repositories.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockStorageState::default()),
        }
    }

    /// Register a storage repository.
    pub fn add_sr(&self, name: impl Into<String>, read_only: bool) {
        if let Ok(mut state) = self.state.write() {
            state.srs.insert(name.into(), read_only);
        }
    }

    /// Make the next attach fail with `message`.
    pub fn fail_next_attach(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.write() {
            state.fail_next_attach = Some(message.into());
        }
    }

    /// Whether the disk is currently attached.
    pub fn is_attached(&self, disk: &DiskRef) -> bool {
        self.state
            .read()
            .map(|state| state.attached.contains(disk))
            .unwrap_or(false)
    }

    fn error(&self, message: String) -> HypervisorError {
        HypervisorError::Storage {
            backend: self.name().to_string(),
            messages: vec![message],
        }
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    fn name(&self) -> &str {
        "mock"
    }

    #[instrument(skip(self), fields(disk = %disk))]
    async fn attach(&self, dbg: &str, disk: &DiskRef, writable: bool) -> Result<AttachInfo> {
        let mut state = self
            .state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        if let Some(message) = state.fail_next_attach.take() {
            return Err(self.error(message));
        }

        let info = match disk {
            DiskRef::Local(path) => AttachInfo {
                path: path.clone(),
                read_only: false,
            },
            DiskRef::Vdi { sr, vdi } => {
                let read_only = *state
                    .srs
                    .get(sr)
                    .ok_or_else(|| self.error(format!("Storage repository not found: {}", sr)))?;
                AttachInfo {
                    path: format!("/dev/mock/{}/{}", sr, vdi),
                    read_only,
                }
            }
        };

        if writable && info.read_only {
            return Err(self.error(format!("{} is read-only", disk)));
        }

        state.attached.insert(disk.clone());
        debug!(path = %info.path, "Mock disk attached");
        Ok(info)
    }

    #[instrument(skip(self), fields(disk = %disk))]
    async fn detach(&self, dbg: &str, disk: &DiskRef) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        state.attached.remove(disk);
        debug!("Mock disk detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_only_sr_rejects_writable_attach() {
        let storage = MockStorage::new();
        storage.add_sr("iso", true);
        let disk = DiskRef::Vdi {
            sr: "iso".into(),
            vdi: "install.iso".into(),
        };

        let info = storage.attach("test", &disk, false).await.unwrap();
        assert!(info.read_only);
        assert!(storage.is_attached(&disk));

        storage.detach("test", &disk).await.unwrap();
        assert!(!storage.is_attached(&disk));

        assert!(storage.attach("test", &disk, true).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_sr() {
        let storage = MockStorage::new();
        let disk = DiskRef::Vdi {
            sr: "missing".into(),
            vdi: "x".into(),
        };
        assert!(matches!(
            storage.attach("test", &disk, false).await,
            Err(HypervisorError::Storage { .. })
        ));
    }
}
