//! Error types for the hypervisor and storage collaborator layer.

use std::time::Duration;

use thiserror::Error;

use crate::types::DomId;

/// Errors that can occur while driving the hypervisor or storage backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    DomainNotFound(DomId),

    /// Building the domain failed.
    #[error("Failed to build domain: {0}")]
    BuildFailed(String),

    /// The PV bootloader exited with an error.
    #[error("Bootloader failed: {stderr}")]
    BootloaderFailed { stdout: String, stderr: String },

    /// The guest has nothing it can boot from.
    #[error("No bootable device")]
    NoBootableDevice,

    /// The device model (emulator) could not be started.
    #[error("Failed to start device model: {0}")]
    DeviceModelFailed(String),

    /// The guest did not acknowledge a shutdown request in time.
    #[error("Guest did not acknowledge shutdown after {elapsed:?}")]
    ShutdownTimeout { elapsed: Duration },

    /// The backend (or the guest) refused to release a device.
    #[error("Detach of {device} rejected: {reason}")]
    DetachRejected { device: String, reason: String },

    /// Not enough host memory for the request.
    #[error("Insufficient memory: needed {needed_mib} MiB, {free_mib} MiB free")]
    InsufficientMemory { needed_mib: u64, free_mib: u64 },

    /// Guests did not balloon down far enough.
    #[error("Ballooning failed, uncooperative domains: {uncooperative:?}")]
    BallooningFailed { uncooperative: Vec<DomId> },

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A remote service (migration peer, storage daemon) is unreachable.
    #[error("Remote service unreachable: {0}")]
    RemoteUnreachable(String),

    /// A kernel module needed by the operation is not loaded.
    #[error("Required kernel module not loaded: {0}")]
    KernelModuleMissing(String),

    /// A lifecycle hook script failed.
    #[error("Hook {script} failed: {reason}")]
    HookFailed {
        script: String,
        reason: String,
        stdout: String,
        stderr: String,
    },

    /// The storage backend reported an error.
    #[error("Storage backend {backend} error: {messages:?}")]
    Storage { backend: String, messages: Vec<String> },

    /// General operation failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
