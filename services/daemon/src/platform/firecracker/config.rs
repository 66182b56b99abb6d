//! Firecracker API request bodies and guest network addressing.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// First address of the pool guest subnets are carved from.
const POOL_BASE: Ipv4Addr = Ipv4Addr::new(172, 30, 0, 0);

/// Number of /30 subnets in the /16 pool.
pub const POOL_SUBNETS: u32 = 1 << 14;

/// Machine configuration for the microVM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

impl MachineConfig {
    pub fn new(vcpu_count: u32, mem_size_mib: u64) -> Self {
        Self {
            vcpu_count,
            mem_size_mib,
            smt: Some(false),
        }
    }
}

/// Boot source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

/// Block device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Writable root disk.
    pub fn root_disk(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// Exposes the metadata service on the listed interfaces.
#[derive(Debug, Clone, Serialize)]
pub struct MmdsConfig {
    pub network_interfaces: Vec<String>,
}

/// Data served to the guest by the metadata service.
#[derive(Debug, Clone, Serialize)]
pub struct GuestMetadata {
    pub hostname: String,
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCreate {
    pub snapshot_type: &'static str,
    pub snapshot_path: PathBuf,
    pub mem_file_path: PathBuf,
}

impl SnapshotCreate {
    pub fn full(snapshot_path: PathBuf, mem_file_path: PathBuf) -> Self {
        Self {
            snapshot_type: "Full",
            snapshot_path,
            mem_file_path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemBackend {
    pub backend_type: &'static str,
    pub backend_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotLoad {
    pub snapshot_path: PathBuf,
    pub mem_backend: MemBackend,
    pub resume_vm: bool,
}

impl SnapshotLoad {
    /// Load a full snapshot and let the guest run straight away.
    pub fn resuming(snapshot_path: PathBuf, mem_file_path: PathBuf) -> Self {
        Self {
            snapshot_path,
            mem_backend: MemBackend {
                backend_type: "File",
                backend_path: mem_file_path,
            },
            resume_vm: true,
        }
    }
}

/// Point-to-point /30 between the host TAP and one guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNetwork {
    pub index: u32,
    pub host: Ipv4Addr,
    pub guest: Ipv4Addr,
}

impl GuestNetwork {
    /// Subnet number `index` of the pool. `None` past the end.
    pub fn from_index(index: u32) -> Option<Self> {
        if index >= POOL_SUBNETS {
            return None;
        }
        let base = u32::from(POOL_BASE) + index * 4;
        Some(Self {
            index,
            host: Ipv4Addr::from(base + 1),
            guest: Ipv4Addr::from(base + 2),
        })
    }

    pub fn tap_name(&self) -> String {
        format!("vmhtap{}", self.index)
    }

    /// Locally administered unicast MAC derived from the guest address.
    pub fn guest_mac(&self) -> String {
        let [a, b, c, d] = self.guest.octets();
        format!("06:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
    }

    /// Kernel `ip=` argument configuring eth0 statically.
    pub fn kernel_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.252::eth0:off",
            self.guest, self.host
        )
    }
}

/// Full kernel command line for a guest.
pub fn boot_args(base: &str, network: &GuestNetwork) -> String {
    format!("{} {}", base.trim(), network.kernel_arg())
}
