//! In-memory platform for testing and development.
//!
//! VM state lives in a table shared by the platform and every driver it
//! hands out, so a second daemon built on the same `MockPlatform` sees the
//! same "hypervisor" as the first. Failures, delays and crashes can be
//! injected at runtime.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    DriverState, Platform, PlatformError, ResourceSpec, VmDescription, VmDriver,
};

/// Host CPU count the mock pretends to have.
const MOCK_HOST_CPUS: u32 = 64;

/// Operation counters.
#[derive(Debug, Default)]
pub struct MockStats {
    pub creates: AtomicU64,
    pub loads: AtomicU64,
    pub starts: AtomicU64,
    pub stops: AtomicU64,
    pub suspends: AtomicU64,
    pub resumes: AtomicU64,
    pub removals: AtomicU64,
}

impl MockStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

struct MockVm {
    state: DriverState,
    address: Ipv4Addr,
    resources: ResourceSpec,
    exit_tx: Option<watch::Sender<bool>>,
}

impl MockVm {
    fn boot(&mut self) {
        let (tx, _) = watch::channel(false);
        self.exit_tx = Some(tx);
        self.state = DriverState::Running;
    }

    fn halt(&mut self, state: DriverState) {
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(true);
        }
        self.state = state;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MockVmConfig {
    address: Ipv4Addr,
}

struct Shared {
    vms: Mutex<HashMap<String, MockVm>>,
    removed: Mutex<Vec<String>>,
    next_host: AtomicU32,
    stats: MockStats,
    supports_suspend: AtomicBool,
    healthy: AtomicBool,
    addresses_ready: AtomicBool,
    fail_creates: AtomicBool,
    fail_starts: AtomicBool,
    fail_stops: AtomicBool,
    fail_suspends: AtomicBool,
    fail_removals: AtomicBool,
    op_delay_ms: AtomicU64,
}

impl Shared {
    fn vms(&self) -> MutexGuard<'_, HashMap<String, MockVm>> {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let ms = self.op_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Mock platform for testing and development.
#[derive(Clone)]
pub struct MockPlatform {
    shared: Arc<Shared>,
}

impl MockPlatform {
    /// Create a new mock platform.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                vms: Mutex::new(HashMap::new()),
                removed: Mutex::new(Vec::new()),
                next_host: AtomicU32::new(2),
                stats: MockStats::default(),
                supports_suspend: AtomicBool::new(true),
                healthy: AtomicBool::new(true),
                addresses_ready: AtomicBool::new(true),
                fail_creates: AtomicBool::new(false),
                fail_starts: AtomicBool::new(false),
                fail_stops: AtomicBool::new(false),
                fail_suspends: AtomicBool::new(false),
                fail_removals: AtomicBool::new(false),
                op_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Create a mock platform without suspend support.
    pub fn without_suspend() -> Self {
        let platform = Self::new();
        platform
            .shared
            .supports_suspend
            .store(false, Ordering::SeqCst);
        platform
    }

    pub fn stats(&self) -> &MockStats {
        &self.shared.stats
    }

    /// Delay applied to every driver lifecycle call.
    pub fn set_op_delay(&self, delay: Duration) {
        self.shared
            .op_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    /// When false, guests never report an address.
    pub fn set_addresses_ready(&self, ready: bool) {
        self.shared.addresses_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.shared.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.shared.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stops(&self, fail: bool) {
        self.shared.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_suspends(&self, fail: bool) {
        self.shared.fail_suspends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_removals(&self, fail: bool) {
        self.shared.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Kill a running VM behind the daemon's back.
    pub fn crash(&self, name: &str) {
        if let Some(vm) = self.shared.vms().get_mut(name) {
            info!(instance = %name, "[MOCK] Crashing VM");
            vm.halt(DriverState::Off);
        }
    }

    /// Simulate a host reboot: every running VM is gone.
    pub fn power_off_all(&self) {
        for vm in self.shared.vms().values_mut() {
            if vm.state == DriverState::Running {
                vm.halt(DriverState::Off);
            }
        }
    }

    /// Ground truth for `name`, `None` if the mock has never heard of it.
    pub fn vm_state(&self, name: &str) -> Option<DriverState> {
        self.shared.vms().get(name).map(|vm| vm.state)
    }

    pub fn vm_resources(&self, name: &str) -> Option<ResourceSpec> {
        self.shared.vms().get(name).map(|vm| vm.resources)
    }

    /// Names passed to `remove_resources_for`, in call order.
    pub fn removed(&self) -> Vec<String> {
        self.shared
            .removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_address(&self) -> Ipv4Addr {
        let host = self.shared.next_host.fetch_add(1, Ordering::SeqCst);
        let [_, _, hi, lo] = host.to_be_bytes();
        Ipv4Addr::new(10, 0, hi, lo)
    }

    fn driver(&self, name: &str) -> Box<dyn VmDriver> {
        Box::new(MockDriver {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_suspend(&self) -> bool {
        self.shared.supports_suspend.load(Ordering::SeqCst)
    }

    async fn create(&self, desc: &VmDescription) -> Result<Box<dyn VmDriver>, PlatformError> {
        if self.shared.fail_creates.load(Ordering::SeqCst) {
            return Err(PlatformError::Operation(
                "mock platform configured to fail creates".to_string(),
            ));
        }
        if desc.resources.cpus > MOCK_HOST_CPUS {
            return Err(PlatformError::ResourceUnavailable(format!(
                "{} CPUs requested, host has {}",
                desc.resources.cpus, MOCK_HOST_CPUS
            )));
        }

        info!(
            instance = %desc.name,
            image_hash = %desc.image_hash,
            cpus = desc.resources.cpus,
            memory_mib = desc.resources.memory_mib(),
            "[MOCK] Creating VM"
        );
        self.shared.delay().await;

        let address = self.next_address();
        self.shared.vms().insert(
            desc.name.clone(),
            MockVm {
                state: DriverState::Off,
                address,
                resources: desc.resources,
                exit_tx: None,
            },
        );
        self.shared.stats.creates.fetch_add(1, Ordering::SeqCst);

        Ok(self.driver(&desc.name))
    }

    async fn load(
        &self,
        name: &str,
        resources: &ResourceSpec,
        config: &serde_json::Value,
    ) -> Result<Box<dyn VmDriver>, PlatformError> {
        let config: MockVmConfig = serde_json::from_value(config.clone())
            .map_err(|e| PlatformError::InvalidConfig(e.to_string()))?;

        self.shared
            .vms()
            .entry(name.to_string())
            .or_insert_with(|| MockVm {
                state: DriverState::Off,
                address: config.address,
                resources: *resources,
                exit_tx: None,
            });
        self.shared.stats.loads.fetch_add(1, Ordering::SeqCst);

        debug!(instance = %name, "[MOCK] Loaded VM");
        Ok(self.driver(name))
    }

    async fn remove_resources_for(&self, name: &str) -> Result<(), PlatformError> {
        self.shared
            .removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
        self.shared.stats.removals.fetch_add(1, Ordering::SeqCst);

        if self.shared.fail_removals.load(Ordering::SeqCst) {
            return Err(PlatformError::Operation(format!(
                "mock platform failed to remove {name}"
            )));
        }

        if let Some(mut vm) = self.shared.vms().remove(name) {
            vm.halt(DriverState::Off);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), PlatformError> {
        if self.shared.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PlatformError::Unhealthy(
                "mock platform marked unhealthy".to_string(),
            ))
        }
    }
}

/// Driver for a single mock VM.
pub struct MockDriver {
    name: String,
    shared: Arc<Shared>,
}

impl MockDriver {
    fn with_vm<T>(&self, f: impl FnOnce(&mut MockVm) -> T) -> Result<T, PlatformError> {
        let mut vms = self.shared.vms();
        let vm = vms.get_mut(&self.name).ok_or_else(|| {
            PlatformError::Operation(format!("VM {} no longer exists", self.name))
        })?;
        Ok(f(vm))
    }
}

#[async_trait]
impl VmDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<(), PlatformError> {
        self.shared.delay().await;
        if self.shared.fail_starts.load(Ordering::SeqCst) {
            return Err(PlatformError::Operation(
                "mock platform configured to fail starts".to_string(),
            ));
        }

        self.with_vm(|vm| {
            if vm.state != DriverState::Running {
                vm.boot();
            }
        })?;
        self.shared.stats.starts.fetch_add(1, Ordering::SeqCst);
        info!(instance = %self.name, "[MOCK] VM started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PlatformError> {
        self.shared.delay().await;
        if self.shared.fail_stops.load(Ordering::SeqCst) {
            return Err(PlatformError::Operation(
                "mock platform configured to fail stops".to_string(),
            ));
        }

        self.with_vm(|vm| vm.halt(DriverState::Off))?;
        self.shared.stats.stops.fetch_add(1, Ordering::SeqCst);
        info!(instance = %self.name, "[MOCK] VM stopped");
        Ok(())
    }

    async fn suspend(&mut self) -> Result<(), PlatformError> {
        if !self.shared.supports_suspend.load(Ordering::SeqCst) {
            return Err(PlatformError::Unsupported(
                "suspend is disabled on this mock".to_string(),
            ));
        }
        self.shared.delay().await;
        if self.shared.fail_suspends.load(Ordering::SeqCst) {
            return Err(PlatformError::Operation(
                "mock platform configured to fail suspends".to_string(),
            ));
        }

        self.with_vm(|vm| match vm.state {
            DriverState::Running => {
                vm.halt(DriverState::Suspended);
                Ok(())
            }
            DriverState::Suspended => Ok(()),
            DriverState::Off => Err(PlatformError::Operation(format!(
                "VM {} is not running",
                self.name
            ))),
        })??;
        self.shared.stats.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlatformError> {
        self.shared.delay().await;
        if self.shared.fail_starts.load(Ordering::SeqCst) {
            return Err(PlatformError::Operation(
                "mock platform configured to fail starts".to_string(),
            ));
        }

        self.with_vm(|vm| match vm.state {
            DriverState::Suspended => {
                vm.boot();
                Ok(())
            }
            DriverState::Running => Ok(()),
            DriverState::Off => Err(PlatformError::SnapshotMissing(self.name.clone())),
        })??;
        self.shared.stats.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn current_state(&self) -> DriverState {
        self.with_vm(|vm| vm.state).unwrap_or(DriverState::Off)
    }

    async fn get_ip(&self) -> Option<IpAddr> {
        if !self.shared.addresses_ready.load(Ordering::SeqCst) {
            return None;
        }
        self.with_vm(|vm| (vm.state == DriverState::Running).then_some(vm.address))
            .ok()
            .flatten()
            .map(IpAddr::V4)
    }

    fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        self.with_vm(|vm| vm.exit_tx.as_ref().map(watch::Sender::subscribe))
            .ok()
            .flatten()
    }

    async fn resize(&mut self, resources: &ResourceSpec) -> Result<(), PlatformError> {
        self.shared.delay().await;
        self.with_vm(|vm| vm.resources = *resources)
    }

    fn config(&self) -> serde_json::Value {
        self.with_vm(|vm| MockVmConfig {
            address: vm.address,
        })
        .ok()
        .and_then(|config| serde_json::to_value(config).ok())
        .unwrap_or(serde_json::Value::Null)
    }
}
