//! Error types for the control plane.
//!
//! Every error is serializable so that it can be stored in a failed task and
//! returned over any transport.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmplane_hypervisor::HypervisorError;

use crate::model::{ObjectKind, PowerState};

/// Control-plane error.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Error {
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: ObjectKind, id: String },

    #[error("{kind} {id} does not exist")]
    DoesNotExist { kind: ObjectKind, id: String },

    #[error("Operation not implemented: {operation}")]
    Unimplemented { operation: String },

    #[error("Invalid vCPU count {requested} (max {max})")]
    InvalidVcpus { requested: u32, max: u32 },

    #[error("Bad power state: expected one of {expected:?}, actual {actual}")]
    BadPowerState {
        expected: Vec<PowerState>,
        actual: PowerState,
    },

    #[error("Domain of VM {vm} has not been built")]
    DomainNotBuilt { vm: String },

    #[error("Guest did not acknowledge shutdown after {elapsed_secs:.1}s")]
    ShutdownTimeout { elapsed_secs: f64 },

    #[error("{kind} {device} of VM {vm} is already connected")]
    DeviceAlreadyConnected {
        kind: ObjectKind,
        device: String,
        vm: String,
    },

    #[error("{kind} {device} of VM {vm} is not connected")]
    DeviceNotConnected {
        kind: ObjectKind,
        device: String,
        vm: String,
    },

    #[error("Detach of {kind} {device} from VM {vm} rejected: {reason}")]
    DeviceDetachRejected {
        kind: ObjectKind,
        device: String,
        vm: String,
        reason: String,
    },

    #[error("Media in vbd {device} of VM {vm} is not ejectable")]
    MediaNotEjectable { device: String, vm: String },

    #[error("Media already present in vbd {device} of VM {vm}")]
    MediaPresent { device: String, vm: String },

    #[error("No media present in vbd {device} of VM {vm}")]
    MediaNotPresent { device: String, vm: String },

    #[error("No bootable device")]
    NoBootableDevice,

    #[error("Bootloader failed: {stderr}")]
    BootloaderFailed { stdout: String, stderr: String },

    #[error("Insufficient memory: needed {needed_mib} MiB, {free_mib} MiB free")]
    InsufficientMemory { needed_mib: u64, free_mib: u64 },

    #[error("Memory shortfall of {shortfall_mib} MiB")]
    MemoryShortfall { shortfall_mib: u64 },

    #[error("Ballooning failed, uncooperative: {uncooperative:?}")]
    BallooningFailed { uncooperative: Vec<String> },

    #[error("Remote service unreachable: {target}")]
    RemoteUnreachable { target: String },

    #[error("Hook {script} failed: {reason}")]
    HookFailed {
        script: String,
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("Task {task} was cancelled")]
    Cancelled { task: String },

    #[error("Storage backend {backend} error: {messages:?}")]
    StorageBackend { backend: String, messages: Vec<String> },

    #[error("Required kernel module not loaded: {module}")]
    KernelModuleMissing { module: String },

    #[error("Invalid memory range: min {min_mib} MiB, max {max_mib} MiB, static max {static_max_mib} MiB")]
    InvalidMemoryRange {
        min_mib: u64,
        max_mib: u64,
        static_max_mib: u64,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Task {task} is still in progress")]
    TaskInProgress { task: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub(crate) fn does_not_exist(kind: ObjectKind, id: impl Into<String>) -> Self {
        Error::DoesNotExist { kind, id: id.into() }
    }

    pub(crate) fn already_exists(kind: ObjectKind, id: impl Into<String>) -> Self {
        Error::AlreadyExists { kind, id: id.into() }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub(crate) fn bad_power_state(expected: &[PowerState], actual: PowerState) -> Self {
        Error::BadPowerState {
            expected: expected.to_vec(),
            actual,
        }
    }
}

impl From<HypervisorError> for Error {
    fn from(err: HypervisorError) -> Self {
        match err {
            HypervisorError::BootloaderFailed { stdout, stderr } => Error::BootloaderFailed { stdout, stderr },
            HypervisorError::NoBootableDevice => Error::NoBootableDevice,
            HypervisorError::ShutdownTimeout { elapsed } => Error::ShutdownTimeout {
                elapsed_secs: elapsed.as_secs_f64(),
            },
            HypervisorError::InsufficientMemory { needed_mib, free_mib } => {
                Error::InsufficientMemory { needed_mib, free_mib }
            }
            HypervisorError::BallooningFailed { uncooperative } => Error::BallooningFailed {
                uncooperative: uncooperative.iter().map(|d| format!("domid {}", d)).collect(),
            },
            HypervisorError::RemoteUnreachable(target) => Error::RemoteUnreachable { target },
            HypervisorError::KernelModuleMissing(module) => Error::KernelModuleMissing { module },
            HypervisorError::HookFailed {
                script,
                reason,
                stdout,
                stderr,
            } => Error::HookFailed {
                script,
                reason,
                stdout,
                stderr,
            },
            HypervisorError::Storage { backend, messages } => Error::StorageBackend { backend, messages },
            other => Error::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_serializes_with_code_tag() {
        let err = Error::bad_power_state(&[PowerState::Running], PowerState::Halted);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "bad_power_state");
        assert_eq!(json["expected"][0], "running");
        assert_eq!(json["actual"], "halted");

        let back: Error = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_backend_errors_keep_their_kind() {
        let err: Error = HypervisorError::ShutdownTimeout {
            elapsed: Duration::from_millis(1500),
        }
        .into();
        assert_eq!(err, Error::ShutdownTimeout { elapsed_secs: 1.5 });

        let err: Error = HypervisorError::Storage {
            backend: "nfs".into(),
            messages: vec!["stale handle".into()],
        }
        .into();
        assert!(matches!(err, Error::StorageBackend { backend, .. } if backend == "nfs"));

        let err: Error = HypervisorError::DomainNotFound(4).into();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
