//! Firecracker platform and per-instance driver.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::api::FirecrackerClient;
use super::config::{
    boot_args, BootSource, DriveConfig, GuestMetadata, GuestNetwork, MachineConfig, MmdsConfig,
    NetworkInterface, SnapshotCreate, SnapshotLoad, POOL_SUBNETS,
};
use super::{tap, ApiError, FirecrackerConfig};
use crate::platform::resources::SystemResources;
use crate::platform::{
    DriverState, Platform, PlatformError, ResourceSpec, VmDescription, VmDriver,
};

const QCOW2_MAGIC: &[u8; 4] = b"QFI\xfb";

const VM_FILE: &str = "vm.json";
const DISK_FILE: &str = "disk.img";
const SOCKET_FILE: &str = "firecracker.socket";
const LOG_FILE: &str = "firecracker.log";
const SNAPSHOT_FILE: &str = "vm.snap";
const MEMORY_FILE: &str = "vm.mem";

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PID_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backend configuration persisted by the daemon and mirrored to `vm.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VmConfig {
    network: GuestNetwork,
    ssh_public_key: String,
    /// Firecracker process currently running the guest.
    #[serde(default)]
    pid: Option<u32>,
}

fn pid_alive(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Whether a `/proc/<pid>/cmdline` belongs to a Firecracker serving `socket`.
fn launched_with_socket(cmdline: &[u8], socket: &Path) -> bool {
    let socket = socket.as_os_str().as_bytes();
    let mut args = cmdline.split(|b| *b == 0);
    while let Some(arg) = args.next() {
        if arg == b"--api-sock" {
            return args.next() == Some(socket);
        }
    }
    false
}

/// Whether `pid` is alive and still the process serving `socket`. A pid
/// recorded by an earlier run may since have been reused.
fn owns_pid(pid: u32, socket: &Path) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => launched_with_socket(&cmdline, socket),
        Err(_) => false,
    }
}

fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Exit signal for a process we spawned.
fn watch_child(mut child: Child) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let status = child.wait().await;
        debug!(status = ?status, "Firecracker process exited");
        let _ = tx.send(true);
    });
    rx
}

/// Exit signal for a process inherited from a previous daemon run.
fn watch_pid(pid: u32, socket: PathBuf) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        while owns_pid(pid, &socket) {
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
        let _ = tx.send(true);
    });
    rx
}

async fn read_vm_config(dir: &Path) -> Option<VmConfig> {
    let data = tokio::fs::read(dir.join(VM_FILE)).await.ok()?;
    serde_json::from_slice(&data).ok()
}

/// Reject image formats Firecracker cannot boot.
async fn check_image(path: &Path) -> Result<(), PlatformError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read == magic.len() && &magic == QCOW2_MAGIC {
        return Err(PlatformError::ImageIncompatible(format!(
            "{} is a qcow2 image, only raw disk images are supported",
            path.display()
        )));
    }
    Ok(())
}

/// Driver for one Firecracker guest.
pub struct FirecrackerDriver {
    name: String,
    dir: PathBuf,
    config: Arc<FirecrackerConfig>,
    resources: ResourceSpec,
    vm: VmConfig,
    exit: Option<watch::Receiver<bool>>,
}

impl FirecrackerDriver {
    fn new(
        name: &str,
        dir: PathBuf,
        config: Arc<FirecrackerConfig>,
        resources: ResourceSpec,
        vm: VmConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            dir,
            config,
            resources,
            vm,
            exit: None,
        }
    }

    /// Pick up a process left running by a previous daemon.
    fn adopt(&mut self) {
        match self.vm.pid {
            Some(pid) if owns_pid(pid, &self.path(SOCKET_FILE)) => {
                info!(instance = %self.name, pid, "Re-attached to running VM");
                self.exit = Some(watch_pid(pid, self.path(SOCKET_FILE)));
            }
            Some(pid) => {
                debug!(instance = %self.name, pid, "Recorded VM process is gone");
                self.vm.pid = None;
            }
            None => {}
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn is_running(&self) -> bool {
        if let Some(exit) = &self.exit {
            if *exit.borrow() {
                return false;
            }
        }
        let socket = self.path(SOCKET_FILE);
        self.vm.pid.is_some_and(|pid| owns_pid(pid, &socket))
    }

    fn has_snapshot(&self) -> bool {
        self.path(SNAPSHOT_FILE).exists() && self.path(MEMORY_FILE).exists()
    }

    fn client(&self) -> FirecrackerClient {
        FirecrackerClient::new(self.path(SOCKET_FILE), self.config.api_timeout)
    }

    async fn save(&self) -> Result<(), PlatformError> {
        let data = serde_json::to_vec_pretty(&self.vm)
            .map_err(|e| PlatformError::InvalidConfig(e.to_string()))?;
        let tmp = self.path(&format!("{VM_FILE}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.path(VM_FILE)).await?;
        Ok(())
    }

    async fn remove_snapshot(&self) {
        for file in [SNAPSHOT_FILE, MEMORY_FILE] {
            let _ = tokio::fs::remove_file(self.path(file)).await;
        }
    }

    /// Launch a Firecracker process and wait for its API socket.
    async fn spawn_process(&mut self) -> Result<FirecrackerClient, PlatformError> {
        tap::ensure_tap(&self.vm.network).await?;

        let socket = self.path(SOCKET_FILE);
        let _ = tokio::fs::remove_file(&socket).await;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(LOG_FILE))?;
        let log_err = log.try_clone()?;

        let child = Command::new(&self.config.firecracker_bin)
            .arg("--api-sock")
            .arg(&socket)
            .arg("--id")
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            PlatformError::Operation("firecracker exited immediately".to_string())
        })?;
        self.vm.pid = Some(pid);
        self.exit = Some(watch_child(child));
        debug!(instance = %self.name, pid, "Spawned firecracker");

        let deadline = Instant::now() + self.config.socket_timeout;
        while !socket.exists() {
            if Instant::now() >= deadline || !self.is_running() {
                self.kill().await;
                return Err(PlatformError::Operation(format!(
                    "firecracker API socket did not appear, see {}",
                    self.path(LOG_FILE).display()
                )));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        Ok(FirecrackerClient::new(&socket, self.config.api_timeout))
    }

    /// Wait up to `timeout` for the current process to exit.
    async fn wait_exit(&self, timeout: Duration) -> bool {
        match &self.exit {
            Some(exit) => {
                let mut exit = exit.clone();
                let result = tokio::time::timeout(timeout, exit.wait_for(|exited| *exited)).await;
                result.is_ok()
            }
            None => {
                let deadline = Instant::now() + timeout;
                while self.is_running() {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
                }
                true
            }
        }
    }

    async fn kill(&mut self) {
        if let Some(pid) = self.vm.pid {
            if self.is_running() {
                kill_pid(pid);
                if !self.wait_exit(self.config.shutdown_timeout).await {
                    error!(instance = %self.name, pid, "Firecracker process survived SIGKILL");
                }
            }
        }
        self.vm.pid = None;
        self.exit = None;
        let _ = tokio::fs::remove_file(self.path(SOCKET_FILE)).await;
    }

    async fn boot(&self, client: &FirecrackerClient) -> Result<(), ApiError> {
        let network = &self.vm.network;

        client
            .put_machine_config(&MachineConfig::new(
                self.resources.cpus,
                self.resources.memory_mib(),
            ))
            .await?;
        client
            .put_boot_source(&BootSource {
                kernel_image_path: self.config.kernel_path.clone(),
                boot_args: Some(boot_args(&self.config.boot_args, network)),
            })
            .await?;
        client
            .put_drive(&DriveConfig::root_disk(self.path(DISK_FILE)))
            .await?;
        client
            .put_network_interface(&NetworkInterface {
                iface_id: "eth0".to_string(),
                host_dev_name: network.tap_name(),
                guest_mac: Some(network.guest_mac()),
            })
            .await?;
        client
            .put_mmds_config(&MmdsConfig {
                network_interfaces: vec!["eth0".to_string()],
            })
            .await?;
        client
            .put_mmds(&GuestMetadata {
                hostname: self.name.clone(),
                ssh_authorized_keys: vec![self.vm.ssh_public_key.clone()],
            })
            .await?;
        client.start_instance().await
    }
}

#[async_trait]
impl VmDriver for FirecrackerDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<(), PlatformError> {
        if self.is_running() {
            return Ok(());
        }
        SystemResources::measure().check(&self.resources)?;
        self.remove_snapshot().await;

        info!(
            instance = %self.name,
            cpus = self.resources.cpus,
            memory_mib = self.resources.memory_mib(),
            "Booting VM"
        );

        let client = self.spawn_process().await?;
        if let Err(e) = self.boot(&client).await {
            error!(instance = %self.name, error = %e, "Failed to boot VM");
            self.kill().await;
            self.save().await?;
            return Err(e.into());
        }

        self.save().await?;
        info!(instance = %self.name, pid = ?self.vm.pid, "VM started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PlatformError> {
        if self.is_running() {
            info!(instance = %self.name, "Stopping VM");
            match self.client().send_ctrl_alt_del().await {
                Ok(()) => {
                    if !self.wait_exit(self.config.shutdown_timeout).await {
                        warn!(instance = %self.name, "Guest did not shut down, killing");
                    }
                }
                Err(e) => {
                    warn!(instance = %self.name, error = %e, "CtrlAltDel failed, killing");
                }
            }
        }
        self.kill().await;
        self.remove_snapshot().await;
        self.save().await
    }

    async fn suspend(&mut self) -> Result<(), PlatformError> {
        if !self.is_running() {
            return Err(PlatformError::Operation(format!(
                "{} is not running",
                self.name
            )));
        }

        let client = self.client();
        client.pause().await?;
        let snapshot = SnapshotCreate::full(self.path(SNAPSHOT_FILE), self.path(MEMORY_FILE));
        if let Err(e) = client.create_snapshot(&snapshot).await {
            self.remove_snapshot().await;
            if let Err(resume_err) = client.resume().await {
                warn!(
                    instance = %self.name,
                    error = %resume_err,
                    "Failed to resume VM after snapshot failure"
                );
            }
            return Err(e.into());
        }

        self.kill().await;
        self.save().await?;
        info!(instance = %self.name, "VM suspended");
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlatformError> {
        if self.is_running() {
            return Ok(());
        }
        if !self.has_snapshot() {
            return Err(PlatformError::SnapshotMissing(self.name.clone()));
        }

        let client = self.spawn_process().await?;
        let snapshot = SnapshotLoad::resuming(self.path(SNAPSHOT_FILE), self.path(MEMORY_FILE));
        if let Err(e) = client.load_snapshot(&snapshot).await {
            error!(instance = %self.name, error = %e, "Failed to load snapshot");
            self.kill().await;
            self.save().await?;
            return Err(e.into());
        }

        self.remove_snapshot().await;
        self.save().await?;
        info!(instance = %self.name, pid = ?self.vm.pid, "VM resumed");
        Ok(())
    }

    async fn current_state(&self) -> DriverState {
        if self.is_running() {
            DriverState::Running
        } else if self.has_snapshot() {
            DriverState::Suspended
        } else {
            DriverState::Off
        }
    }

    async fn get_ip(&self) -> Option<IpAddr> {
        self.is_running()
            .then_some(IpAddr::V4(self.vm.network.guest))
    }

    fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        if self.is_running() {
            self.exit.clone()
        } else {
            None
        }
    }

    async fn resize(&mut self, resources: &ResourceSpec) -> Result<(), PlatformError> {
        if self.is_running() || self.has_snapshot() {
            return Err(PlatformError::Operation(format!(
                "{} must be off to resize",
                self.name
            )));
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.path(DISK_FILE))
            .await?;
        if file.metadata().await?.len() < resources.disk_bytes {
            file.set_len(resources.disk_bytes).await?;
        }

        self.resources = *resources;
        self.save().await
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(&self.vm).unwrap_or_default()
    }
}

/// Platform booting guests with Firecracker.
pub struct FirecrackerPlatform {
    config: Arc<FirecrackerConfig>,
    instances_dir: PathBuf,
    /// Guest subnet index per instance.
    networks: Mutex<BTreeMap<String, u32>>,
}

impl FirecrackerPlatform {
    pub fn new(config: FirecrackerConfig, data_dir: &Path) -> Self {
        let instances_dir = data_dir.join("instances");
        let networks = scan_networks(&instances_dir);
        Self {
            config: Arc::new(config),
            instances_dir,
            networks: Mutex::new(networks),
        }
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir.join(name)
    }

    fn networks(&self) -> MutexGuard<'_, BTreeMap<String, u32>> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, name: &str) -> Result<GuestNetwork, PlatformError> {
        let mut networks = self.networks();
        let index = match networks.get(name) {
            Some(index) => *index,
            None => {
                let used: BTreeSet<u32> = networks.values().copied().collect();
                let index = (0..POOL_SUBNETS)
                    .find(|i| !used.contains(i))
                    .ok_or_else(|| {
                        PlatformError::ResourceUnavailable(
                            "guest address pool exhausted".to_string(),
                        )
                    })?;
                networks.insert(name.to_string(), index);
                index
            }
        };
        GuestNetwork::from_index(index).ok_or_else(|| {
            PlatformError::InvalidConfig(format!("network index {index} out of range"))
        })
    }
}

/// Subnet assignments recorded in existing instance directories.
fn scan_networks(instances_dir: &Path) -> BTreeMap<String, u32> {
    let mut networks = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(instances_dir) else {
        return networks;
    };
    for entry in entries.flatten() {
        let Ok(data) = std::fs::read(entry.path().join(VM_FILE)) else {
            continue;
        };
        if let Ok(vm) = serde_json::from_slice::<VmConfig>(&data) {
            networks.insert(
                entry.file_name().to_string_lossy().to_string(),
                vm.network.index,
            );
        }
    }
    networks
}

#[async_trait]
impl Platform for FirecrackerPlatform {
    fn name(&self) -> &'static str {
        "firecracker"
    }

    fn supports_suspend(&self) -> bool {
        true
    }

    async fn create(&self, desc: &VmDescription) -> Result<Box<dyn VmDriver>, PlatformError> {
        check_image(&desc.image_path).await?;
        SystemResources::measure().check(&desc.resources)?;

        let dir = self.instance_dir(&desc.name);
        if dir.exists() {
            warn!(instance = %desc.name, "Removing leftover instance directory");
            tokio::fs::remove_dir_all(&dir).await?;
        }

        let network = self.allocate(&desc.name)?;
        let result = async {
            tokio::fs::create_dir_all(&dir).await?;

            let disk = dir.join(DISK_FILE);
            tokio::fs::copy(&desc.image_path, &disk).await?;
            let file = tokio::fs::OpenOptions::new().write(true).open(&disk).await?;
            if file.metadata().await?.len() < desc.resources.disk_bytes {
                file.set_len(desc.resources.disk_bytes).await?;
            }

            tap::ensure_tap(&network).await?;

            let vm = VmConfig {
                network,
                ssh_public_key: desc.ssh_public_key.clone(),
                pid: None,
            };
            let driver = FirecrackerDriver::new(
                &desc.name,
                dir.clone(),
                Arc::clone(&self.config),
                desc.resources,
                vm,
            );
            driver.save().await?;
            Ok::<_, PlatformError>(driver)
        }
        .await;

        match result {
            Ok(driver) => {
                info!(
                    instance = %desc.name,
                    address = %network.guest,
                    tap = %network.tap_name(),
                    "Instance prepared"
                );
                Ok(Box::new(driver))
            }
            Err(e) => {
                self.networks().remove(&desc.name);
                let _ = tokio::fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    async fn load(
        &self,
        name: &str,
        resources: &ResourceSpec,
        config: &serde_json::Value,
    ) -> Result<Box<dyn VmDriver>, PlatformError> {
        let persisted: VmConfig = serde_json::from_value(config.clone())
            .map_err(|e| PlatformError::InvalidConfig(format!("{name}: {e}")))?;

        let dir = self.instance_dir(name);
        if !dir.exists() {
            return Err(PlatformError::InvalidConfig(format!(
                "instance directory {} is missing",
                dir.display()
            )));
        }

        // vm.json is written after every operation and may be newer
        let vm = read_vm_config(&dir).await.unwrap_or(persisted);
        self.networks().insert(name.to_string(), vm.network.index);

        let mut driver =
            FirecrackerDriver::new(name, dir, Arc::clone(&self.config), *resources, vm);
        driver.adopt();
        Ok(Box::new(driver))
    }

    async fn remove_resources_for(&self, name: &str) -> Result<(), PlatformError> {
        let dir = self.instance_dir(name);
        let vm = read_vm_config(&dir).await;

        if let Some(pid) = vm.as_ref().and_then(|vm| vm.pid) {
            if owns_pid(pid, &dir.join(SOCKET_FILE)) {
                warn!(instance = %name, pid, "Killing VM process during removal");
                kill_pid(pid);
            }
        }

        let index = vm
            .map(|vm| vm.network.index)
            .or_else(|| self.networks().get(name).copied());
        let tap_result = match index.and_then(GuestNetwork::from_index) {
            Some(network) => tap::delete_tap(&network.tap_name()).await,
            None => Ok(()),
        };

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.networks().remove(name);

        tap_result?;
        debug!(instance = %name, "Removed instance resources");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), PlatformError> {
        let required = [
            ("firecracker binary", &self.config.firecracker_bin),
            ("guest kernel", &self.config.kernel_path),
            ("KVM device", &self.config.kvm_device),
        ];
        for (what, path) in required {
            if !path.exists() {
                return Err(PlatformError::Unhealthy(format!(
                    "{what} not found at {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(dir: &Path) -> FirecrackerPlatform {
        let config = FirecrackerConfig {
            firecracker_bin: dir.join("firecracker"),
            kernel_path: dir.join("vmlinux"),
            kvm_device: dir.join("kvm"),
            ..FirecrackerConfig::default()
        };
        FirecrackerPlatform::new(config, dir)
    }

    fn vm_config(index: u32) -> serde_json::Value {
        serde_json::to_value(VmConfig {
            network: GuestNetwork::from_index(index).unwrap(),
            ssh_public_key: "ssh-ed25519 AAAA".to_string(),
            pid: None,
        })
        .unwrap()
    }

    fn description(image: &Path) -> VmDescription {
        VmDescription {
            name: "foo".to_string(),
            resources: ResourceSpec::default(),
            image_path: image.to_path_buf(),
            image_hash: "aa".to_string(),
            ssh_public_key: "ssh-ed25519 AAAA".to_string(),
        }
    }

    #[tokio::test]
    async fn test_health_check_requires_binary_kernel_and_kvm() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());

        let err = platform.health_check().await.unwrap_err();
        assert!(matches!(err, PlatformError::Unhealthy(ref m) if m.contains("firecracker")));

        for file in ["firecracker", "vmlinux", "kvm"] {
            std::fs::write(dir.path().join(file), b"").unwrap();
        }
        platform.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_qcow2() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.qcow2");
        std::fs::write(&image, b"QFI\xfb\x00\x00\x00\x03").unwrap();

        let err = platform(dir.path())
            .create(&description(&image))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlatformError::ImageIncompatible(_)));
        assert!(!dir.path().join("instances/foo").exists());
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = platform(dir.path())
            .load("foo", &ResourceSpec::default(), &serde_json::json!({"address": "10.0.0.2"}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlatformError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_loaded_driver_reports_ground_truth() {
        let dir = tempfile::tempdir().unwrap();
        let instance_dir = dir.path().join("instances/foo");
        std::fs::create_dir_all(&instance_dir).unwrap();

        let platform = platform(dir.path());
        let mut driver = platform
            .load("foo", &ResourceSpec::default(), &vm_config(4))
            .await
            .unwrap();
        assert_eq!(driver.current_state().await, DriverState::Off);
        assert_eq!(driver.get_ip().await, None);
        assert!(driver.exit_signal().is_none());

        let err = driver.resume().await.unwrap_err();
        assert!(matches!(err, PlatformError::SnapshotMissing(_)));

        std::fs::write(instance_dir.join(SNAPSHOT_FILE), b"state").unwrap();
        std::fs::write(instance_dir.join(MEMORY_FILE), b"memory").unwrap();
        assert_eq!(driver.current_state().await, DriverState::Suspended);

        assert_eq!(driver.config()["network"]["index"], 4);
    }

    #[tokio::test]
    async fn test_resize_grows_disk() {
        let dir = tempfile::tempdir().unwrap();
        let instance_dir = dir.path().join("instances/foo");
        std::fs::create_dir_all(&instance_dir).unwrap();
        std::fs::write(instance_dir.join(DISK_FILE), vec![0u8; 1024]).unwrap();

        let platform = platform(dir.path());
        let mut driver = platform
            .load("foo", &ResourceSpec::default(), &vm_config(0))
            .await
            .unwrap();

        let bigger = ResourceSpec {
            disk_bytes: 1 << 20,
            ..ResourceSpec::default()
        };
        driver.resize(&bigger).await.unwrap();
        let len = std::fs::metadata(instance_dir.join(DISK_FILE)).unwrap().len();
        assert_eq!(len, 1 << 20);
        assert!(instance_dir.join(VM_FILE).exists());
    }

    #[tokio::test]
    async fn test_allocation_skips_subnets_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("instances/bar");
        std::fs::create_dir_all(&existing).unwrap();
        std::fs::write(
            existing.join(VM_FILE),
            serde_json::to_vec(&vm_config(0)).unwrap(),
        )
        .unwrap();

        let platform = platform(dir.path());
        assert_eq!(platform.allocate("foo").unwrap().index, 1);
        assert_eq!(platform.allocate("foo").unwrap().index, 1);
        assert_eq!(platform.allocate("baz").unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_remove_resources_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let instance_dir = dir.path().join("instances/foo");
        std::fs::create_dir_all(&instance_dir).unwrap();
        std::fs::write(
            instance_dir.join(VM_FILE),
            serde_json::to_vec(&vm_config(9000)).unwrap(),
        )
        .unwrap();

        let platform = platform(dir.path());
        platform.remove_resources_for("foo").await.unwrap();
        assert!(!instance_dir.exists());
        platform.remove_resources_for("foo").await.unwrap();
        assert_eq!(platform.allocate("next").unwrap().index, 0);
    }

    #[test]
    fn test_launched_with_socket() {
        let socket = Path::new("/var/lib/vmhost/instances/foo/firecracker.socket");
        let ours =
            b"/usr/bin/firecracker\0--api-sock\0/var/lib/vmhost/instances/foo/firecracker.socket\0--id\0foo\0";
        assert!(launched_with_socket(ours, socket));

        let other_instance =
            b"/usr/bin/firecracker\0--api-sock\0/var/lib/vmhost/instances/bar/firecracker.socket\0";
        assert!(!launched_with_socket(other_instance, socket));
        assert!(!launched_with_socket(b"sleep\x0030\0", socket));
        assert!(!launched_with_socket(b"", socket));
        assert!(!launched_with_socket(b"firecracker\0--api-sock\0", socket));
    }

    #[tokio::test]
    async fn test_reused_pid_is_not_adopted_or_killed() {
        let dir = tempfile::tempdir().unwrap();
        let instance_dir = dir.path().join("instances/foo");
        std::fs::create_dir_all(&instance_dir).unwrap();

        let mut stranger = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut config = vm_config(9000);
        config["pid"] = serde_json::json!(stranger.id());
        std::fs::write(instance_dir.join(VM_FILE), serde_json::to_vec(&config).unwrap()).unwrap();

        let platform = platform(dir.path());
        let driver = platform
            .load("foo", &ResourceSpec::default(), &config)
            .await
            .unwrap();
        assert_eq!(driver.current_state().await, DriverState::Off);
        assert!(driver.exit_signal().is_none());
        assert!(driver.config()["pid"].is_null());

        platform.remove_resources_for("foo").await.unwrap();
        assert!(!instance_dir.exists());
        assert!(stranger.try_wait().unwrap().is_none());

        stranger.kill().unwrap();
        stranger.wait().unwrap();
    }
}
