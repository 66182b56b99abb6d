//! Firecracker reference backend.
//!
//! ## Components
//!
//! - `api`: HTTP client for Firecracker's Unix socket API
//! - `config`: API request bodies and guest addressing
//! - `tap`: host TAP devices
//! - `backend`: the [`Platform`](super::Platform) and
//!   [`VmDriver`](super::VmDriver) implementations
//!
//! Every instance owns `<data_dir>/instances/<name>/`, holding its private
//! root disk, the API socket, the process log, `vm.json` and, while
//! suspended, the snapshot files.

mod api;
mod backend;
mod config;
mod tap;

use std::path::PathBuf;
use std::time::Duration;

pub use api::{ApiError, FirecrackerClient};
pub use backend::{FirecrackerDriver, FirecrackerPlatform};
pub use config::GuestNetwork;
pub use tap::TapError;

/// Configuration for the Firecracker backend.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    pub firecracker_bin: PathBuf,
    /// Uncompressed guest kernel.
    pub kernel_path: PathBuf,
    pub kvm_device: PathBuf,
    /// Kernel arguments preceding the network configuration.
    pub boot_args: String,
    /// How long to wait for a new process's API socket.
    pub socket_timeout: Duration,
    pub api_timeout: Duration,
    /// Grace period after CtrlAltDel before the process is killed.
    pub shutdown_timeout: Duration,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/vmhost/kernel/vmlinux"),
            kvm_device: PathBuf::from("/dev/kvm"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            socket_timeout: Duration::from_secs(5),
            api_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<ApiError> for super::PlatformError {
    fn from(err: ApiError) -> Self {
        Self::Operation(format!("firecracker API: {err}"))
    }
}

impl From<TapError> for super::PlatformError {
    fn from(err: TapError) -> Self {
        Self::Operation(err.to_string())
    }
}
