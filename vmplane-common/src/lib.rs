//! # vmplane Common
//!
//! Shared utilities for the vmplane daemon and libraries.
//!
//! ## Logging
//!
//! ```rust
//! use vmplane_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(vm_id = "vm-1", "VM started");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
