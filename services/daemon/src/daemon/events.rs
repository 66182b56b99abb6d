//! Asynchronous results flowing back into the registry.
//!
//! Backend work runs in spawned tasks outside the registry lock. Its results
//! come back here as events tagged with the generation they were started
//! under, and a single loop applies them in arrival order. An event whose
//! generation no longer matches the instance is stale and is dropped.

use std::net::IpAddr;
use std::sync::Weak;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::registry::{InstanceInfo, InstanceState, SharedDriver};
use super::Inner;
use crate::error::DaemonError;

pub(crate) type Reply = oneshot::Sender<Result<InstanceInfo, DaemonError>>;

pub(crate) enum DaemonEvent {
    /// A lifecycle operation finished.
    Completed {
        name: String,
        generation: u64,
        outcome: Outcome,
        reply: Reply,
    },
    /// The VM process backing a running instance went away.
    ProcessExited { name: String, generation: u64 },
    /// A running instance's guest address became known.
    AddressResolved {
        name: String,
        generation: u64,
        address: IpAddr,
    },
}

/// Where an instance ends up once an operation is over.
pub(crate) struct Landing {
    pub state: InstanceState,
    pub address: Option<IpAddr>,
    pub exit: Option<watch::Receiver<bool>>,
    pub config: Option<serde_json::Value>,
    pub driver: Option<SharedDriver>,
    pub image_hash: Option<String>,
    pub trash: bool,
}

impl Landing {
    /// Land in `state` with nothing else learned.
    pub fn at(state: InstanceState) -> Self {
        Self {
            state,
            address: None,
            exit: None,
            config: None,
            driver: None,
            image_hash: None,
            trash: false,
        }
    }
}

pub(crate) enum Outcome {
    Landed(Landing),
    /// `fallback` describes what the backend looks like after the failure.
    /// `None` means the instance never came to exist and is dropped.
    Failed {
        error: DaemonError,
        fallback: Option<Landing>,
    },
}

/// Apply events until the daemon goes away.
pub(crate) async fn run(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<DaemonEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(event).await;
    }
    debug!("Event loop stopped");
}

impl Inner {
    async fn apply(&self, event: DaemonEvent) {
        match event {
            DaemonEvent::Completed {
                name,
                generation,
                outcome,
                reply,
            } => {
                let result = self.apply_completion(&name, generation, outcome).await;
                let _ = reply.send(result);
            }
            DaemonEvent::ProcessExited { name, generation } => {
                self.apply_exit(&name, generation).await;
            }
            DaemonEvent::AddressResolved {
                name,
                generation,
                address,
            } => {
                self.apply_address(&name, generation, address).await;
            }
        }
    }

    async fn apply_completion(
        &self,
        name: &str,
        generation: u64,
        outcome: Outcome,
    ) -> Result<InstanceInfo, DaemonError> {
        let mut registry = self.registry.write().await;
        let instance = registry.get_mut(name)?;

        if instance.generation != generation {
            warn!(
                instance = %name,
                expected = generation,
                current = instance.generation,
                "Discarding stale completion"
            );
            return Err(DaemonError::Internal(format!(
                "instance {name} changed while the operation was running"
            )));
        }

        let (landing, error) = match outcome {
            Outcome::Landed(landing) => (landing, None),
            Outcome::Failed {
                error,
                fallback: Some(landing),
            } => (landing, Some(error)),
            Outcome::Failed {
                error,
                fallback: None,
            } => {
                registry.remove(name);
                if let Err(e) = self.store.delete_instance(name) {
                    error!(instance = %name, error = %e, "Failed to delete record of failed instance");
                }
                warn!(instance = %name, error = %error, "Instance creation failed");
                return Err(error);
            }
        };

        let from = instance.state;
        let generation = instance.commit(landing.state);
        instance.address = landing.address;
        if let Some(driver) = landing.driver {
            instance.driver = Some(driver);
        }
        if let Some(config) = landing.config {
            instance.backend_config = config;
        }
        if let Some(hash) = landing.image_hash {
            instance.image_hash = Some(hash);
        }
        if landing.trash {
            instance.trashed = true;
        }

        let persisted = self.store.upsert_instance(&instance.to_record());
        let info = instance.to_info();
        drop(registry);

        if let Some(exit) = landing.exit {
            self.watch_exit(name.to_string(), generation, exit);
        }

        match error {
            None => {
                info!(
                    instance = %name,
                    from = %from,
                    to = %info.state,
                    generation,
                    "State transition"
                );
                persisted?;
                Ok(info)
            }
            Some(error) => {
                warn!(
                    instance = %name,
                    from = %from,
                    to = %info.state,
                    error = %error,
                    "Operation failed, state reverted"
                );
                if let Err(e) = persisted {
                    error!(instance = %name, error = %e, "Failed to persist reverted state");
                }
                Err(error)
            }
        }
    }

    async fn apply_exit(&self, name: &str, generation: u64) {
        let mut registry = self.registry.write().await;
        let Ok(instance) = registry.get_mut(name) else {
            return;
        };

        if instance.generation != generation || instance.state != InstanceState::Running {
            debug!(
                instance = %name,
                generation,
                current = instance.generation,
                "Ignoring stale exit notification"
            );
            return;
        }

        warn!(instance = %name, "Instance exited unexpectedly");
        instance.commit(InstanceState::Off);
        if let Err(e) = self.store.upsert_instance(&instance.to_record()) {
            error!(instance = %name, error = %e, "Failed to persist exited instance");
        }
    }

    async fn apply_address(&self, name: &str, generation: u64, address: IpAddr) {
        let mut registry = self.registry.write().await;
        let Ok(instance) = registry.get_mut(name) else {
            return;
        };

        if instance.generation != generation
            || instance.state != InstanceState::Running
            || instance.address == Some(address)
        {
            return;
        }

        info!(instance = %name, address = %address, "Instance address resolved");
        instance.address = Some(address);
        if let Err(e) = self.store.upsert_instance(&instance.to_record()) {
            error!(instance = %name, error = %e, "Failed to persist instance address");
        }
    }

    /// Report the exit of the process started at `generation`.
    pub(crate) fn watch_exit(&self, name: String, generation: u64, mut exit: watch::Receiver<bool>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                if *exit.borrow_and_update() {
                    break;
                }
                if exit.changed().await.is_err() {
                    // Driver dropped without the process exiting
                    if !*exit.borrow() {
                        return;
                    }
                    break;
                }
            }
            let _ = events.send(DaemonEvent::ProcessExited { name, generation });
        });
    }
}
