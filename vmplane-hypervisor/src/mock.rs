//! Mock hypervisor backend for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{Hypervisor, HypervisorCapabilities};
use crate::types::*;

/// Capacity of the domain event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Mock hypervisor backend.
///
/// Simulates domains in memory without requiring an actual hypervisor.
/// Useful for:
/// - Unit and integration testing
/// - Development on machines without a hypervisor
///
/// Failures can be injected per operation name (the trait method name, e.g.
/// `"build_domain"`) with [`MockBackend::inject_failure`], and operations can
/// be slowed down with [`MockBackend::set_delay`].
pub struct MockBackend {
    state: RwLock<MockState>,
    events: broadcast::Sender<DomainEvent>,
}

struct MockState {
    domains: HashMap<DomId, MockDomain>,
    next_domid: DomId,
    host_cpu: HostCpuInfo,
    total_memory_mib: u64,
    console: Vec<String>,
    /// Suspend images written by `suspend_domain`
    images: HashSet<String>,
    failures: HashMap<String, VecDeque<HypervisorError>>,
    delays: HashMap<String, Duration>,
    /// Domains whose guests ignore shutdown requests
    unresponsive: HashSet<DomId>,
}

struct MockDomain {
    vm_id: String,
    memory_mib: u64,
    /// Balloon floor set by the last memory target
    memory_min_mib: u64,
    vcpus: u32,
    built: bool,
    device_model: bool,
    paused: bool,
    shadow_multiplier: f64,
    xsdata: BTreeMap<String, String>,
    vbds: HashMap<String, Option<String>>,
    vifs: HashMap<String, bool>,
    pcis: HashSet<String>,
}

impl MockBackend {
    /// Create a new mock backend with a 16 GiB, 8 CPU host.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(MockState {
                domains: HashMap::new(),
                next_domid: 1,
                host_cpu: HostCpuInfo {
                    vendor: "GenuineIntel".to_string(),
                    model: "Mock CPU".to_string(),
                    cpu_count: 8,
                    socket_count: 1,
                    speed_mhz: 2400,
                    flags: vec!["fpu".to_string(), "vmx".to_string(), "sse2".to_string()],
                    features: "1fcbfbff-f7fa3223".to_string(),
                },
                total_memory_mib: 16 * 1024,
                console: Vec::new(),
                images: HashSet::new(),
                failures: HashMap::new(),
                delays: HashMap::new(),
                unresponsive: HashSet::new(),
            }),
            events,
        }
    }

    /// Report a different host.
    pub fn with_host(self, cpu: HostCpuInfo, total_memory_mib: u64) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.host_cpu = cpu;
            state.total_memory_mib = total_memory_mib;
        }
        self
    }

    /// Make the next call of `operation` fail with `error`.
    ///
    /// Several failures for the same operation are returned in order.
    pub fn inject_failure(&self, operation: &str, error: HypervisorError) {
        if let Ok(mut state) = self.state.write() {
            state
                .failures
                .entry(operation.to_string())
                .or_default()
                .push_back(error);
        }
    }

    /// Delay every call of `operation`.
    pub fn set_delay(&self, operation: &str, delay: Duration) {
        if let Ok(mut state) = self.state.write() {
            state.delays.insert(operation.to_string(), delay);
        }
    }

    /// Make the guest in `domid` ignore shutdown requests.
    pub fn set_unresponsive(&self, domid: DomId) {
        if let Ok(mut state) = self.state.write() {
            state.unresponsive.insert(domid);
        }
    }

    /// Publish an unattended event for a domain, as the guest would.
    pub fn emit_event(&self, domid: DomId, reason: ShutdownReason) {
        let event = DomainEvent {
            domid,
            kind: DomainEventKind::Shutdown(reason),
        };
        if self.events.send(event).is_err() {
            debug!(domid, "No domain event subscribers");
        }
    }

    /// Number of live domains.
    pub fn domain_count(&self) -> usize {
        self.state.read().map(|s| s.domains.len()).unwrap_or(0)
    }

    /// Domain id of the VM, if it has a live domain.
    pub fn domid_of(&self, vm_id: &str) -> Option<DomId> {
        let state = self.state.read().ok()?;
        state
            .domains
            .iter()
            .find(|(_, d)| d.vm_id == vm_id)
            .map(|(domid, _)| *domid)
    }

    /// Balloon range `(min, max)` of a domain, in MiB.
    pub fn memory_range_mib(&self, domid: DomId) -> Option<(u64, u64)> {
        let state = self.state.read().ok()?;
        state.domains.get(&domid).map(|d| (d.memory_min_mib, d.memory_mib))
    }

    /// Ids of the block devices attached to a domain.
    pub fn attached_vbds(&self, domid: DomId) -> Vec<String> {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return Vec::new(),
        };
        let mut ids: Vec<String> = state
            .domains
            .get(&domid)
            .map(|d| d.vbds.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Sleep for the configured delay, then return any injected failure.
    async fn simulate(&self, operation: &str) -> Result<()> {
        let delay = {
            let state = self.read()?;
            state.delays.get(operation).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write()?;
        if let Some(error) = state.failures.get_mut(operation).and_then(|q| q.pop_front()) {
            warn!(operation, error = %error, "Injected failure");
            return Err(error);
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MockState>> {
        self.state
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Run `f` against a live domain.
    fn with_domain<T>(&self, domid: DomId, f: impl FnOnce(&mut MockDomain) -> Result<T>) -> Result<T> {
        let mut state = self.write()?;
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or(HypervisorError::DomainNotFound(domid))?;
        f(domain)
    }

    fn log_console(&self, line: String) {
        if let Ok(mut state) = self.state.write() {
            state.console.push(line);
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn claimed_memory_mib(&self) -> u64 {
        self.domains.values().map(|d| d.memory_mib).sum()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        Ok(HypervisorCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
            supports_live_migration: true,
            supports_hotplug: true,
            supports_pci_passthrough: true,
            supports_hvm: true,
            max_vcpus: 128,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn host_cpu(&self) -> Result<HostCpuInfo> {
        Ok(self.read()?.host_cpu.clone())
    }

    async fn total_memory_mib(&self) -> Result<u64> {
        Ok(self.read()?.total_memory_mib)
    }

    async fn free_memory_mib(&self) -> Result<u64> {
        let state = self.read()?;
        Ok(state.total_memory_mib.saturating_sub(state.claimed_memory_mib()))
    }

    async fn console_data(&self) -> Result<String> {
        let state = self.read()?;
        let mut data = state.console.join("\n");
        if !data.is_empty() {
            data.push('\n');
        }
        Ok(data)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    #[instrument(skip(self, config), fields(vm_id = %config.id))]
    async fn create_domain(&self, config: &VmConfig) -> Result<DomId> {
        self.simulate("create_domain").await?;

        let mut state = self.write()?;
        let needed_mib = config.memory.static_max_mib;
        let free_mib = state.total_memory_mib.saturating_sub(state.claimed_memory_mib());
        if needed_mib > free_mib {
            return Err(HypervisorError::InsufficientMemory { needed_mib, free_mib });
        }

        let domid = state.next_domid;
        state.next_domid += 1;
        state.domains.insert(
            domid,
            MockDomain {
                vm_id: config.id.clone(),
                memory_mib: config.memory.dynamic_max_mib,
                memory_min_mib: config.memory.dynamic_min_mib,
                vcpus: config.vcpus.current,
                built: false,
                device_model: false,
                paused: true,
                shadow_multiplier: config.shadow_multiplier,
                xsdata: config.xsdata.clone(),
                vbds: HashMap::new(),
                vifs: HashMap::new(),
                pcis: HashSet::new(),
            },
        );
        state.console.push(format!("(XEN) domain {} created for {}", domid, config.id));

        info!(domid, "Mock domain created");
        Ok(domid)
    }

    #[instrument(skip(self, config), fields(vm_id = %config.id))]
    async fn build_domain(&self, domid: DomId, config: &VmConfig, boot_disk: Option<&str>) -> Result<()> {
        self.simulate("build_domain").await?;

        if let BootMethod::Pv(PvBoot::Indirect { .. }) = config.boot {
            if boot_disk.is_none() {
                return Err(HypervisorError::NoBootableDevice);
            }
        }

        self.with_domain(domid, |d| {
            if d.built {
                return Err(HypervisorError::BuildFailed(format!("domain {} already built", domid)));
            }
            d.built = true;
            Ok(())
        })?;

        info!(domid, "Mock domain built");
        Ok(())
    }

    #[instrument(skip(self, config), fields(vm_id = %config.id))]
    async fn create_device_model(&self, domid: DomId, config: &VmConfig, restore: bool) -> Result<Vec<Console>> {
        self.simulate("create_device_model").await?;

        self.with_domain(domid, |d| {
            if !d.built {
                return Err(HypervisorError::DeviceModelFailed(format!("domain {} not built", domid)));
            }
            d.device_model = true;
            Ok(())
        })?;

        let mut consoles = vec![Console {
            protocol: ConsoleProtocol::Vt100,
            port: 0,
            path: format!("/dev/pts/{}", domid),
        }];
        if config.is_hvm() {
            consoles.push(Console {
                protocol: ConsoleProtocol::Rfb,
                port: 5900 + domid as u16,
                path: String::new(),
            });
        }

        debug!(domid, restore, consoles = consoles.len(), "Mock device model started");
        Ok(consoles)
    }

    #[instrument(skip(self))]
    async fn destroy_domain(&self, domid: DomId) -> Result<()> {
        self.simulate("destroy_domain").await?;

        let mut state = self.write()?;
        state
            .domains
            .remove(&domid)
            .ok_or(HypervisorError::DomainNotFound(domid))?;
        state.unresponsive.remove(&domid);
        state.console.push(format!("(XEN) domain {} destroyed", domid));

        info!(domid, "Mock domain destroyed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pause_domain(&self, domid: DomId) -> Result<()> {
        self.simulate("pause_domain").await?;
        self.with_domain(domid, |d| {
            d.paused = true;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn unpause_domain(&self, domid: DomId) -> Result<()> {
        self.simulate("unpause_domain").await?;
        self.with_domain(domid, |d| {
            if !d.built {
                return Err(HypervisorError::OperationFailed(format!("domain {} not built", domid)));
            }
            d.paused = false;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    async fn shutdown_domain(&self, domid: DomId, reason: ShutdownReason, timeout: Duration) -> Result<()> {
        self.simulate("shutdown_domain").await?;

        let unresponsive = {
            let state = self.read()?;
            if !state.domains.contains_key(&domid) {
                return Err(HypervisorError::DomainNotFound(domid));
            }
            state.unresponsive.contains(&domid)
        };

        if unresponsive {
            tokio::time::sleep(timeout).await;
            warn!(domid, "Guest ignored shutdown request");
            return Err(HypervisorError::ShutdownTimeout { elapsed: timeout });
        }

        info!(domid, ?reason, "Guest acknowledged shutdown");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn suspend_domain(&self, domid: DomId, path: &str) -> Result<()> {
        self.simulate("suspend_domain").await?;

        let mut state = self.write()?;
        state
            .domains
            .remove(&domid)
            .ok_or(HypervisorError::DomainNotFound(domid))?;
        state.images.insert(path.to_string());

        info!(domid, "Mock domain suspended");
        Ok(())
    }

    #[instrument(skip(self, config), fields(vm_id = %config.id))]
    async fn restore_domain(&self, domid: DomId, config: &VmConfig, path: &str) -> Result<()> {
        self.simulate("restore_domain").await?;

        let mut state = self.write()?;
        if !state.images.remove(path) {
            return Err(HypervisorError::OperationFailed(format!("no suspend image at {}", path)));
        }
        let domain = state
            .domains
            .get_mut(&domid)
            .ok_or(HypervisorError::DomainNotFound(domid))?;
        domain.built = true;

        info!(domid, "Mock domain restored");
        Ok(())
    }

    #[instrument(skip(self, options))]
    async fn migrate_domain(&self, domid: DomId, destination: &str, options: &MigrateOptions) -> Result<()> {
        self.simulate("migrate_domain").await?;

        if destination.is_empty() {
            return Err(HypervisorError::RemoteUnreachable("empty destination".to_string()));
        }
        if !self.read()?.domains.contains_key(&domid) {
            return Err(HypervisorError::DomainNotFound(domid));
        }

        info!(domid, live = options.live, "Mock domain migrated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dump_core(&self, domid: DomId, path: &str) -> Result<()> {
        self.simulate("dump_core").await?;
        self.with_domain(domid, |_| Ok(()))?;
        self.log_console(format!("(XEN) domain {} core dumped to {}", domid, path));
        Ok(())
    }

    async fn domain_info(&self, domid: DomId) -> Result<DomainInfo> {
        self.with_domain(domid, |d| {
            Ok(DomainInfo {
                domid,
                memory_actual_mib: d.memory_mib,
                vcpus_online: d.vcpus,
                rtc_timeoffset: "0".to_string(),
                guest_agent: BTreeMap::new(),
                paused: d.paused,
            })
        })
    }

    #[instrument(skip(self))]
    async fn set_vcpus(&self, domid: DomId, count: u32) -> Result<()> {
        self.simulate("set_vcpus").await?;
        self.with_domain(domid, |d| {
            d.vcpus = count;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn set_memory_target(&self, domid: DomId, min_mib: u64, max_mib: u64) -> Result<()> {
        self.simulate("set_memory_target").await?;
        self.with_domain(domid, |d| {
            d.memory_min_mib = min_mib;
            d.memory_mib = max_mib;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn set_shadow_multiplier(&self, domid: DomId, multiplier: f64) -> Result<()> {
        self.simulate("set_shadow_multiplier").await?;
        self.with_domain(domid, |d| {
            d.shadow_multiplier = multiplier;
            Ok(())
        })
    }

    #[instrument(skip(self, data))]
    async fn write_xsdata(&self, domid: DomId, data: &BTreeMap<String, String>) -> Result<()> {
        self.simulate("write_xsdata").await?;
        self.with_domain(domid, |d| {
            d.xsdata.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    #[instrument(skip(self, vbd), fields(vbd = %vbd.id))]
    async fn attach_vbd(&self, domid: DomId, vbd: &VbdConfig, path: Option<&str>) -> Result<()> {
        self.simulate("attach_vbd").await?;
        self.with_domain(domid, |d| {
            if d.vbds.contains_key(&vbd.id) {
                return Err(HypervisorError::OperationFailed(format!("vbd {} already attached", vbd.id)));
            }
            d.vbds.insert(vbd.id.clone(), path.map(str::to_string));
            Ok(())
        })
    }

    #[instrument(skip(self, vbd), fields(vbd = %vbd.id))]
    async fn detach_vbd(&self, domid: DomId, vbd: &VbdConfig, force: bool) -> Result<()> {
        match self.simulate("detach_vbd").await {
            Err(HypervisorError::DetachRejected { .. }) if force => {
                warn!("Guest refused detach, forcing");
            }
            other => other?,
        }
        self.with_domain(domid, |d| {
            d.vbds.remove(&vbd.id);
            Ok(())
        })
    }

    #[instrument(skip(self, vbd), fields(vbd = %vbd.id))]
    async fn change_media(&self, domid: DomId, vbd: &VbdConfig, path: Option<&str>) -> Result<()> {
        self.simulate("change_media").await?;
        self.with_domain(domid, |d| {
            let media = d
                .vbds
                .get_mut(&vbd.id)
                .ok_or_else(|| HypervisorError::OperationFailed(format!("vbd {} not attached", vbd.id)))?;
            *media = path.map(str::to_string);
            Ok(())
        })
    }

    #[instrument(skip(self, vif), fields(vif = %vif.id))]
    async fn attach_vif(&self, domid: DomId, vif: &VifConfig) -> Result<()> {
        self.simulate("attach_vif").await?;
        self.with_domain(domid, |d| {
            if d.vifs.contains_key(&vif.id) {
                return Err(HypervisorError::OperationFailed(format!("vif {} already attached", vif.id)));
            }
            d.vifs.insert(vif.id.clone(), vif.carrier);
            Ok(())
        })
    }

    #[instrument(skip(self, vif), fields(vif = %vif.id))]
    async fn detach_vif(&self, domid: DomId, vif: &VifConfig, force: bool) -> Result<()> {
        match self.simulate("detach_vif").await {
            Err(HypervisorError::DetachRejected { .. }) if force => {
                warn!("Guest refused detach, forcing");
            }
            other => other?,
        }
        self.with_domain(domid, |d| {
            d.vifs.remove(&vif.id);
            Ok(())
        })
    }

    #[instrument(skip(self, vif), fields(vif = %vif.id))]
    async fn set_carrier(&self, domid: DomId, vif: &VifConfig, carrier: bool) -> Result<()> {
        self.simulate("set_carrier").await?;
        self.with_domain(domid, |d| match d.vifs.get_mut(&vif.id) {
            Some(link) => {
                *link = carrier;
                Ok(())
            }
            None => Err(HypervisorError::OperationFailed(format!("vif {} not attached", vif.id))),
        })
    }

    #[instrument(skip(self, vif, mode), fields(vif = %vif.id))]
    async fn set_locking_mode(&self, domid: DomId, vif: &VifConfig, mode: &LockingMode) -> Result<()> {
        self.simulate("set_locking_mode").await?;
        self.with_domain(domid, |d| {
            if !d.vifs.contains_key(&vif.id) {
                return Err(HypervisorError::OperationFailed(format!("vif {} not attached", vif.id)));
            }
            debug!(?mode, "Mock locking mode applied");
            Ok(())
        })
    }

    #[instrument(skip(self, vif), fields(vif = %vif.id, backend = %backend))]
    async fn move_vif(&self, domid: DomId, vif: &VifConfig, backend: &NetworkBackend) -> Result<()> {
        self.simulate("move_vif").await?;
        self.with_domain(domid, |d| {
            if !d.vifs.contains_key(&vif.id) {
                return Err(HypervisorError::OperationFailed(format!("vif {} not attached", vif.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self, pci), fields(pci = %pci.address))]
    async fn attach_pci(&self, domid: DomId, pci: &PciConfig) -> Result<()> {
        self.simulate("attach_pci").await?;
        self.with_domain(domid, |d| {
            d.pcis.insert(pci.id.clone());
            Ok(())
        })
    }

    #[instrument(skip(self, pci), fields(pci = %pci.address))]
    async fn detach_pci(&self, domid: DomId, pci: &PciConfig, force: bool) -> Result<()> {
        match self.simulate("detach_pci").await {
            Err(HypervisorError::DetachRejected { .. }) if force => {
                warn!("Device refused detach, forcing");
            }
            other => other?,
        }
        self.with_domain(domid, |d| {
            d.pcis.remove(&pci.id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv_config(id: &str) -> VmConfig {
        VmConfig::new(
            id,
            "test-vm",
            BootMethod::Pv(PvBoot::Direct {
                kernel: "/boot/vmlinuz".into(),
                cmdline: "console=hvc0".into(),
                ramdisk: None,
            }),
        )
        .with_memory(256, 512, 1024)
    }

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let backend = MockBackend::new();
        let config = pv_config("vm-1");

        let domid = backend.create_domain(&config).await.unwrap();
        assert_eq!(backend.domid_of("vm-1"), Some(domid));

        backend.build_domain(domid, &config, None).await.unwrap();
        let consoles = backend.create_device_model(domid, &config, false).await.unwrap();
        assert_eq!(consoles[0].protocol, ConsoleProtocol::Vt100);

        backend.unpause_domain(domid).await.unwrap();
        assert!(!backend.domain_info(domid).await.unwrap().paused);

        backend.destroy_domain(domid).await.unwrap();
        assert_eq!(backend.domain_count(), 0);
        assert!(backend.console_data().await.unwrap().contains("destroyed"));
    }

    #[tokio::test]
    async fn test_memory_target_records_balloon_range() {
        let backend = MockBackend::new();
        let domid = backend.create_domain(&pv_config("vm-1")).await.unwrap();
        assert_eq!(backend.memory_range_mib(domid), Some((256, 512)));

        backend.set_memory_target(domid, 300, 400).await.unwrap();
        assert_eq!(backend.memory_range_mib(domid), Some((300, 400)));
        assert_eq!(backend.memory_range_mib(domid + 1), None);
    }

    #[tokio::test]
    async fn test_create_domain_checks_free_memory() {
        let backend = MockBackend::new().with_host(HostCpuInfo::default(), 512);
        let err = backend.create_domain(&pv_config("vm-1")).await.unwrap_err();
        assert_eq!(
            err,
            HypervisorError::InsufficientMemory {
                needed_mib: 1024,
                free_mib: 512
            }
        );
    }

    #[tokio::test]
    async fn test_indirect_boot_needs_a_disk() {
        let backend = MockBackend::new();
        let config = VmConfig::new(
            "vm-1",
            "pygrub",
            BootMethod::Pv(PvBoot::Indirect {
                bootloader: "pygrub".into(),
                extra_args: String::new(),
                legacy_args: String::new(),
                bootloader_args: String::new(),
                devices: Vec::new(),
            }),
        );
        let domid = backend.create_domain(&config).await.unwrap();
        assert_eq!(
            backend.build_domain(domid, &config, None).await,
            Err(HypervisorError::NoBootableDevice)
        );
    }

    #[tokio::test]
    async fn test_injected_failure_is_returned_once() {
        let backend = MockBackend::new();
        backend.inject_failure("create_domain", HypervisorError::BuildFailed("boom".into()));

        assert!(backend.create_domain(&pv_config("vm-1")).await.is_err());
        assert!(backend.create_domain(&pv_config("vm-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_forced_detach_ignores_refusal() {
        let backend = MockBackend::new();
        let config = pv_config("vm-1");
        let domid = backend.create_domain(&config).await.unwrap();
        let vbd = VbdConfig::disk("vm-1", "0", DiskRef::Local("/dev/sdb".into()));
        backend.attach_vbd(domid, &vbd, Some("/dev/sdb")).await.unwrap();

        let refusal = HypervisorError::DetachRejected {
            device: "0".into(),
            reason: "in use".into(),
        };
        backend.inject_failure("detach_vbd", refusal.clone());
        assert_eq!(backend.detach_vbd(domid, &vbd, false).await, Err(refusal.clone()));

        backend.inject_failure("detach_vbd", refusal);
        backend.detach_vbd(domid, &vbd, true).await.unwrap();
        assert!(backend.attached_vbds(domid).is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_guest_times_out() {
        let backend = MockBackend::new();
        let domid = backend.create_domain(&pv_config("vm-1")).await.unwrap();
        backend.set_unresponsive(domid);

        let err = backend
            .shutdown_domain(domid, ShutdownReason::Halt, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::ShutdownTimeout { .. }));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let backend = MockBackend::new();
        let mut rx = backend.subscribe_events();
        backend.emit_event(7, ShutdownReason::Crash);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.domid, 7);
        assert_eq!(event.kind, DomainEventKind::Shutdown(ShutdownReason::Crash));
    }
}
