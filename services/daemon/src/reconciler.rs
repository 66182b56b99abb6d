//! Periodic reconcile loop.
//!
//! Exit watchers catch most unexpected VM exits as they happen. The
//! reconciler covers the rest: it regularly asks the backend what each
//! running instance is doing, feeds exits into the daemon and picks up guest
//! addresses that appeared after the start operation gave up waiting.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::daemon::Daemon;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub poll_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

pub struct Reconciler {
    daemon: Daemon,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(daemon: Daemon, config: ReconcilerConfig) -> Self {
        Self { daemon, config }
    }

    /// Run the reconcile loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting reconciler"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("Probing instances");
                    self.daemon.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
