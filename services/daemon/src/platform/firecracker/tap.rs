//! Host side of guest networking.
//!
//! Each instance gets a TAP device holding the host end of its /30. The
//! guest end is configured from the kernel command line, so nothing inside
//! the guest has to cooperate.

use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::config::GuestNetwork;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to create TAP device {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("failed to delete TAP device {name}: {reason}")]
    DeleteFailed { name: String, reason: String },
}

pub fn tap_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

/// Create and bring up the TAP device for `network`. Existing devices are
/// left alone.
pub async fn ensure_tap(network: &GuestNetwork) -> Result<(), TapError> {
    let name = network.tap_name();
    if tap_exists(&name) {
        debug!(tap = %name, "TAP device already present");
        return Ok(());
    }

    info!(tap = %name, host = %network.host, guest = %network.guest, "Creating TAP device");

    let result = async {
        run_ip(&["tuntap", "add", "dev", &name, "mode", "tap"]).await?;
        run_ip(&["addr", "add", &format!("{}/30", network.host), "dev", &name]).await?;
        run_ip(&["link", "set", "dev", &name, "up"]).await
    }
    .await;

    if let Err(e) = result {
        let _ = run_ip(&["link", "delete", &name]).await;
        return Err(TapError::CreateFailed {
            name,
            reason: format!("{e:#}"),
        });
    }
    Ok(())
}

/// Delete the TAP device named `name` if it exists.
pub async fn delete_tap(name: &str) -> Result<(), TapError> {
    if !tap_exists(name) {
        return Ok(());
    }
    info!(tap = %name, "Deleting TAP device");
    run_ip(&["link", "delete", name])
        .await
        .map_err(|e| TapError::DeleteFailed {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}
