//! Configuration management for the Node Daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use vmplane_core::{ServiceConfig, DEFAULT_DUMP_DIR, DEFAULT_FEED_CAPACITY, DEFAULT_WORKER_POOL_SIZE};
use vmplane_hypervisor::DEFAULT_STORAGE_PATH;

use crate::cli::Args;

/// Where the daemon looks for its configuration when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmplane/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-specific configuration
    pub node: NodeConfig,
    /// REST server configuration
    pub server: ServerConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Control-plane core configuration
    pub service: CoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Configuration built from defaults and CLI arguments only.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(workers) = args.workers {
            self.service.worker_pool_size = workers;
        }

        if let Some(ref dir) = args.hooks_dir {
            self.service.hooks_dir = Some(PathBuf::from(dir));
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
            self.hypervisor.storage = StorageKind::Mock;
        }

        if args.log_json {
            self.logging.json = true;
        }

        self
    }

    /// Settings for the control-plane core.
    pub fn service_config(&self) -> ServiceConfig {
        let mut config = ServiceConfig::default()
            .with_worker_pool_size(self.service.worker_pool_size)
            .with_feed_capacity(self.service.feed_capacity)
            .with_dump_dir(&self.service.dump_dir);
        if let Some(ref dir) = self.service.hooks_dir {
            config = config.with_hooks_dir(dir);
        }
        config
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname (auto-detected if not set)
    pub hostname: Option<String>,
}

impl NodeConfig {
    /// Get the hostname, detecting it if not set.
    pub fn get_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for the REST API
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// How disks are resolved
    pub storage: StorageKind,
    /// Base path of local storage repositories
    pub storage_path: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Mock,
            storage: StorageKind::Local,
            storage_path: DEFAULT_STORAGE_PATH.to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// In-memory hypervisor describing the local host
    #[default]
    Mock,
}

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Directories under `storage_path`
    #[default]
    Local,
    /// In-memory repositories, nothing touches the disk
    Mock,
}

/// Control-plane core configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Number of tasks allowed to run at once
    pub worker_pool_size: usize,
    /// Entries retained by the update feed
    pub feed_capacity: usize,
    /// Root of the lifecycle hook directories
    pub hooks_dir: Option<PathBuf>,
    /// Where crash dumps are written
    pub dump_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            hooks_dir: None,
            dump_dir: PathBuf::from(DEFAULT_DUMP_DIR),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(
            &path,
            "server:\n  listen_address: 127.0.0.1:9000\nservice:\n  worker_pool_size: 3\n  hooks_dir: /etc/vmplane/hooks\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:9000");
        assert_eq!(config.service.worker_pool_size, 3);
        assert_eq!(config.service.feed_capacity, DEFAULT_FEED_CAPACITY);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);

        let service = config.service_config();
        assert_eq!(service.worker_pool_size, 3);
        assert_eq!(service.hooks_dir, Some(PathBuf::from("/etc/vmplane/hooks")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/vmplane/node.yaml").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from(["vmplane-node", "--listen", "0.0.0.0:7000", "--workers", "2", "--log-json"]);
        let config = Config::default_with_cli(&args);
        assert_eq!(config.server.listen_address, "0.0.0.0:7000");
        assert_eq!(config.service.worker_pool_size, 2);
        assert!(config.logging.json);
        assert_eq!(config.hypervisor.storage, StorageKind::Local);

        let args = Args::parse_from(["vmplane-node", "--dev"]);
        assert_eq!(Config::default_with_cli(&args).hypervisor.storage, StorageKind::Mock);
    }
}
