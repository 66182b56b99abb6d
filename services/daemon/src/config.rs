//! Configuration for the daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::daemon::DaemonConfig;
use crate::platform::firecracker::FirecrackerConfig;
use crate::platform::PlatformKind;
use crate::reconciler::ReconcilerConfig;
use crate::vault::VaultConfig;

const GIB: u64 = 1024 * 1024 * 1024;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for the registry, image vault and instance files.
    pub data_dir: PathBuf,

    /// Unix socket the RPC server listens on.
    pub socket_path: PathBuf,

    /// Which platform backend to construct at startup.
    pub platform: PlatformKind,

    /// Image manifest URL used to resolve aliases.
    pub image_manifest_url: String,

    /// Upper bound on the vault's on-disk size in bytes.
    pub cache_max_bytes: u64,

    /// How long a resolved alias stays fresh before it is re-resolved.
    pub image_freshness_secs: u64,

    /// Maximum number of concurrent image downloads.
    pub max_parallel_downloads: usize,

    /// Interval between reconciler passes in seconds.
    pub poll_interval_secs: u64,

    /// Path to the firecracker binary.
    pub firecracker_bin: PathBuf,

    /// Path to the guest kernel.
    pub kernel_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("VMHOST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmhost"));

        let socket_path = lookup("VMHOST_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/vmhost.sock"));

        let platform = match lookup("VMHOST_PLATFORM").as_deref() {
            None | Some("firecracker") => PlatformKind::Firecracker,
            Some("mock") => PlatformKind::Mock,
            Some(other) => bail!("unknown platform backend: {other}"),
        };

        let image_manifest_url = lookup("VMHOST_IMAGE_MANIFEST_URL")
            .unwrap_or_else(|| "https://images.vmhost.dev/manifest.json".to_string());

        let cache_max_bytes = parse_or(&lookup, "VMHOST_CACHE_MAX_BYTES", 50 * GIB);
        let image_freshness_secs = parse_or(&lookup, "VMHOST_IMAGE_FRESHNESS_SECS", 6 * 60 * 60);
        let max_parallel_downloads = parse_or(&lookup, "VMHOST_MAX_PARALLEL_DOWNLOADS", 2usize);
        let poll_interval_secs = parse_or(&lookup, "VMHOST_POLL_INTERVAL_SECS", 5);

        if max_parallel_downloads == 0 {
            bail!("VMHOST_MAX_PARALLEL_DOWNLOADS must be at least 1");
        }

        let firecracker_bin = lookup("VMHOST_FIRECRACKER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/firecracker"));

        let kernel_path = lookup("VMHOST_KERNEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("kernel/vmlinux"));

        let log_level = lookup("VMHOST_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            data_dir,
            socket_path,
            platform,
            image_manifest_url,
            cache_max_bytes,
            image_freshness_secs,
            max_parallel_downloads,
            poll_interval_secs,
            firecracker_bin,
            kernel_path,
            log_level,
        })
    }

    pub fn vault_config(&self) -> VaultConfig {
        VaultConfig {
            cache_dir: self.data_dir.join("vault"),
            max_size_bytes: self.cache_max_bytes,
            freshness: Duration::from_secs(self.image_freshness_secs),
            max_parallel_downloads: self.max_parallel_downloads,
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            data_dir: self.data_dir.clone(),
            vault: self.vault_config(),
            ..DaemonConfig::default()
        }
    }

    pub fn firecracker_config(&self) -> FirecrackerConfig {
        FirecrackerConfig {
            firecracker_bin: self.firecracker_bin.clone(),
            kernel_path: self.kernel_path.clone(),
            ..FirecrackerConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}
