//! Daemon wiring and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use vmplane_core::{NodeService, ServiceConfig};
use vmplane_hypervisor::{HostCpuInfo, Hypervisor, LocalBackend, MockBackend, MockStorage, StorageBackend};
use vmplane_telemetry::{HostTelemetry, TelemetryCollector};

use crate::config::{Config, HypervisorBackend, StorageKind};
use crate::http_server;

/// Describe the local host to the mock hypervisor.
fn host_cpu(telemetry: &HostTelemetry) -> HostCpuInfo {
    HostCpuInfo {
        vendor: telemetry.cpu.vendor.clone(),
        model: telemetry.cpu.model.clone(),
        cpu_count: telemetry.cpu.logical_cores as u32,
        socket_count: 1,
        speed_mhz: telemetry.cpu.frequency_mhz,
        flags: telemetry.cpu.flags.clone(),
        features: String::new(),
    }
}

/// Build the control-plane service from configuration.
pub fn build_service(config: &Config, service_config: ServiceConfig) -> NodeService {
    let telemetry = TelemetryCollector::new().collect();
    info!(
        hostname = %telemetry.system.hostname,
        os = %telemetry.system.os_description(),
        cpus = telemetry.cpu.logical_cores,
        memory_mib = telemetry.memory.total_mib(),
        available_mib = telemetry.memory.available_mib(),
        "Host telemetry collected"
    );

    let hypervisor: Arc<dyn Hypervisor> = match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor backend");
            Arc::new(MockBackend::new().with_host(host_cpu(&telemetry), telemetry.memory.total_mib()))
        }
    };

    let storage: Arc<dyn StorageBackend> = match config.hypervisor.storage {
        StorageKind::Local => {
            info!(path = %config.hypervisor.storage_path, "Using local storage backend");
            Arc::new(LocalBackend::with_path(&config.hypervisor.storage_path))
        }
        StorageKind::Mock => {
            info!("Using mock storage backend");
            Arc::new(MockStorage::new())
        }
    };

    NodeService::new(service_config, hypervisor, storage)
}

/// Run the daemon until the REST server stops.
pub async fn run(config: Config) -> Result<()> {
    let service = build_service(&config, config.service_config());

    let pump = service.clone();
    tokio::spawn(async move {
        pump.run_event_pump().await;
    });

    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    info!(
        address = %addr,
        hostname = %config.node.get_hostname(),
        workers = service.config().worker_pool_size,
        "Starting REST server"
    );

    http_server::run_http_server(addr, service).await
}
