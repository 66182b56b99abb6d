//! vmhost daemon
//!
//! Manages local virtual machines on this host.
//!
//! ## Architecture
//!
//! - **Daemon**: registry of named instances and their lifecycle state machine
//! - **Platform**: hypervisor backend selected at startup (Firecracker or mock)
//! - **Vault**: content-addressed cache of boot images
//! - **Reconciler**: polls the backend and feeds unexpected exits back in
//! - **RPC server**: newline-delimited JSON over a Unix socket

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmhost_daemon::config::Config;
use vmhost_daemon::daemon::{Daemon, DaemonParts};
use vmhost_daemon::names::PetNameGenerator;
use vmhost_daemon::platform::DefaultPlatformFactory;
use vmhost_daemon::reconciler::Reconciler;
use vmhost_daemon::rpc::RpcServer;
use vmhost_daemon::ssh::FileSshKeyProvider;
use vmhost_daemon::vault::HttpImageSource;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        data_dir = %config.data_dir.display(),
        socket = %config.socket_path.display(),
        platform = ?config.platform,
        manifest = %config.image_manifest_url,
        "Starting vmhost daemon"
    );

    let image_source = HttpImageSource::new(config.image_manifest_url.clone())
        .context("invalid image manifest URL")?;

    let parts = DaemonParts {
        platform_factory: Box::new(DefaultPlatformFactory::new(
            config.platform,
            config.firecracker_config(),
        )),
        image_source: Arc::new(image_source),
        name_generator: Box::new(PetNameGenerator),
        ssh_keys: Arc::new(FileSshKeyProvider::new(config.data_dir.join("ssh"))),
    };

    let daemon = Daemon::new(config.daemon_config(), parts)
        .await
        .context("failed to start daemon")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(daemon.clone(), config.reconciler_config());
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { reconciler.run(shutdown_rx).await }
    });

    let server = RpcServer::new(config.socket_path.clone(), daemon.clone());
    let mut server_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { server.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("RPC server exited"),
                Ok(Err(e)) => error!(error = %e, "RPC server error"),
                Err(e) => error!(error = %e, "RPC server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = reconciler_handle.await;
        if !server_handle.is_finished() {
            let _ = server_handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        error!("Workers did not stop in time");
    }

    daemon.shutdown().await;
    info!("vmhost daemon stopped");
    Ok(())
}
