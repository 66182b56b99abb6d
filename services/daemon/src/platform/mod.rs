//! Platform backend interface.
//!
//! A platform turns a [`VmDescription`] into a [`VmDriver`] and owns the
//! host-side resources of every instance it created. The daemon never
//! inspects the driver's configuration blob; it persists whatever
//! [`VmDriver::config`] returns and hands it back to [`Platform::load`]
//! after a restart.
//!
//! Two implementations exist:
//! - [`firecracker::FirecrackerPlatform`] boots microVMs through the
//!   Firecracker API socket.
//! - [`mock::MockPlatform`] keeps everything in memory for tests and
//!   development.

pub mod firecracker;
pub mod mock;
pub mod resources;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

pub use firecracker::{FirecrackerConfig, FirecrackerPlatform};
pub use mock::MockPlatform;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Smallest memory size a guest can boot with.
pub const MIN_MEMORY_BYTES: u64 = 128 * MIB;

/// Smallest root disk accepted.
pub const MIN_DISK_BYTES: u64 = 512 * MIB;

/// Errors from platform operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("insufficient host resources: {0}")]
    ResourceUnavailable(String),

    #[error("image incompatible: {0}")]
    ImageIncompatible(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend unhealthy: {0}")]
    Unhealthy(String),

    #[error("no suspend snapshot for instance {0}")]
    SnapshotMissing(String),

    #[error("invalid backend config: {0}")]
    InvalidConfig(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resources requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_bytes: GIB,
            disk_bytes: 5 * GIB,
        }
    }
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.cpus == 0 {
            return Err("at least one CPU is required".to_string());
        }
        if self.memory_bytes < MIN_MEMORY_BYTES {
            return Err(format!(
                "memory must be at least {} MiB",
                MIN_MEMORY_BYTES / MIB
            ));
        }
        if self.disk_bytes < MIN_DISK_BYTES {
            return Err(format!("disk must be at least {} MiB", MIN_DISK_BYTES / MIB));
        }
        Ok(())
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes / MIB
    }
}

/// Everything a platform needs to create an instance.
#[derive(Debug, Clone)]
pub struct VmDescription {
    pub name: String,
    pub resources: ResourceSpec,
    /// Vault path of the verified image.
    pub image_path: PathBuf,
    pub image_hash: String,
    /// Key installed into the guest's authorized keys.
    pub ssh_public_key: String,
}

/// Ground-truth state reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Off,
    Running,
    Suspended,
}

/// Per-instance handle to a backend VM.
#[async_trait]
pub trait VmDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Cold boot. Succeeds without effect when already running.
    async fn start(&mut self) -> Result<(), PlatformError>;

    /// Shut down. Idempotent on a stopped VM; discards any suspend snapshot.
    async fn stop(&mut self) -> Result<(), PlatformError>;

    async fn suspend(&mut self) -> Result<(), PlatformError>;

    /// Restore from the suspend snapshot.
    async fn resume(&mut self) -> Result<(), PlatformError>;

    /// Ask the backend what is actually happening.
    async fn current_state(&self) -> DriverState;

    /// Guest address once networking is up.
    async fn get_ip(&self) -> Option<IpAddr>;

    /// Flips to `true` when the current VM process exits. `None` when the VM
    /// is not running.
    fn exit_signal(&self) -> Option<watch::Receiver<bool>>;

    /// Apply new resources to a stopped VM.
    async fn resize(&mut self, resources: &ResourceSpec) -> Result<(), PlatformError>;

    /// Opaque configuration persisted by the daemon.
    fn config(&self) -> serde_json::Value;
}

/// A hypervisor backend.
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_suspend(&self) -> bool;

    /// Create host-side resources for a new instance and return its driver.
    async fn create(&self, desc: &VmDescription) -> Result<Box<dyn VmDriver>, PlatformError>;

    /// Re-attach to an instance from its persisted configuration.
    async fn load(
        &self,
        name: &str,
        resources: &ResourceSpec,
        config: &serde_json::Value,
    ) -> Result<Box<dyn VmDriver>, PlatformError>;

    /// Remove every host-side artifact belonging to `name`.
    async fn remove_resources_for(&self, name: &str) -> Result<(), PlatformError>;

    async fn health_check(&self) -> Result<(), PlatformError>;
}

/// Builds the daemon's platform at startup.
pub trait PlatformFactory: Send + Sync {
    fn make_platform(&self, data_dir: &Path) -> Result<Arc<dyn Platform>, PlatformError>;
}

/// Which backend [`DefaultPlatformFactory`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    Firecracker,
    Mock,
}

/// Factory selected from configuration.
pub struct DefaultPlatformFactory {
    kind: PlatformKind,
    firecracker: FirecrackerConfig,
}

impl DefaultPlatformFactory {
    pub fn new(kind: PlatformKind, firecracker: FirecrackerConfig) -> Self {
        Self { kind, firecracker }
    }
}

impl PlatformFactory for DefaultPlatformFactory {
    fn make_platform(&self, data_dir: &Path) -> Result<Arc<dyn Platform>, PlatformError> {
        match self.kind {
            PlatformKind::Firecracker => Ok(Arc::new(FirecrackerPlatform::new(
                self.firecracker.clone(),
                data_dir,
            ))),
            PlatformKind::Mock => Ok(Arc::new(MockPlatform::new())),
        }
    }
}

/// Hands out an already constructed platform.
pub struct SharedPlatformFactory(pub Arc<dyn Platform>);

impl PlatformFactory for SharedPlatformFactory {
    fn make_platform(&self, _data_dir: &Path) -> Result<Arc<dyn Platform>, PlatformError> {
        Ok(Arc::clone(&self.0))
    }
}
