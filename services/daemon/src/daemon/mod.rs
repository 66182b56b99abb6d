//! Instance lifecycle.
//!
//! Every lifecycle command runs in two phases:
//!
//! 1. Under the registry lock, validate the command, commit the transient
//!    state (`starting`, `stopping`, ...), bump the generation and persist.
//! 2. Outside the lock, a spawned task drives the backend. Its result is
//!    sent to the event loop (see [`events`]) tagged with the generation
//!    from phase 1 and applied only if the instance has not moved on.
//!
//! A transient state blocks every other command on the same instance with
//! `OperationInProgress`, so at most one backend operation per instance is
//! ever in flight. The caller awaits the result, but the task does not
//! depend on the caller: if the client goes away the operation still
//! completes and the registry stays consistent.

mod events;
mod registry;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use registry::{
    validate_name, Instance, InstanceInfo, InstanceState, Registry, SharedDriver,
};

use crate::error::DaemonError;
use crate::names::NameGenerator;
use crate::platform::{
    DriverState, Platform, PlatformFactory, ResourceSpec, VmDescription, VmDriver,
};
use crate::ssh::SshKeyProvider;
use crate::state::StateStore;
use crate::vault::{ImageSource, ImageVault, VaultConfig};
use events::{DaemonEvent, Landing, Outcome};

/// Receives human-readable progress lines while a create runs.
pub type ProgressSink = mpsc::UnboundedSender<String>;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub vault: VaultConfig,
    /// How long a start waits for the guest to report an address.
    pub address_timeout: Duration,
    pub address_poll_interval: Duration,
    /// Login user reported in SSH info.
    pub ssh_username: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/vmhost"),
            vault: VaultConfig::default(),
            address_timeout: Duration::from_secs(120),
            address_poll_interval: Duration::from_secs(1),
            ssh_username: "ubuntu".to_string(),
        }
    }
}

/// Collaborators injected at construction.
pub struct DaemonParts {
    pub platform_factory: Box<dyn PlatformFactory>,
    pub image_source: Arc<dyn ImageSource>,
    pub name_generator: Box<dyn NameGenerator>,
    pub ssh_keys: Arc<dyn SshKeyProvider>,
}

fn default_image() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Image alias.
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceSpec,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            name: None,
            image: default_image(),
            resources: ResourceSpec::default(),
        }
    }
}

/// New resources for a stopped instance. Unset fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResizeRequest {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub disk_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecInfo {
    pub ssh: SshInfo,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Suspend,
    Restart,
    Trash,
}

impl Command {
    fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Restart => "restart",
            Self::Trash => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Start,
    Resume,
    Stop { trash: bool },
    Suspend,
    Restart { was_running: bool },
}

impl Op {
    fn target(&self) -> InstanceState {
        match self {
            Self::Start | Self::Resume | Self::Restart { .. } => InstanceState::Running,
            Self::Stop { .. } => InstanceState::Off,
            Self::Suspend => InstanceState::Suspended,
        }
    }
}

/// Transient state and backend operation for `command`, or `None` when the
/// instance is already where the command would take it.
fn plan(
    command: Command,
    instance: &Instance,
    platform: &dyn Platform,
) -> Result<Option<(InstanceState, Op)>, DaemonError> {
    use InstanceState::*;

    match (command, instance.state) {
        (Command::Start, Off) => Ok(Some((Starting, Op::Start))),
        (Command::Start, Suspended) => Ok(Some((Starting, Op::Resume))),
        (Command::Start, Running) => Ok(None),
        (Command::Stop, Running | Suspended) => Ok(Some((Stopping, Op::Stop { trash: false }))),
        (Command::Stop, Off) => Ok(None),
        (Command::Suspend, Running) if platform.supports_suspend() => {
            Ok(Some((Suspending, Op::Suspend)))
        }
        (Command::Suspend, Running) => Err(DaemonError::Unsupported(format!(
            "the {} backend cannot suspend instances",
            platform.name()
        ))),
        (Command::Suspend, Suspended) => Ok(None),
        (Command::Restart, Running) => Ok(Some((Restarting, Op::Restart { was_running: true }))),
        (Command::Restart, Off) => Ok(Some((Restarting, Op::Restart { was_running: false }))),
        (Command::Trash, Running | Suspended) => Ok(Some((Stopping, Op::Stop { trash: true }))),
        (Command::Trash, Off) => Ok(None),
        (command, state) => Err(DaemonError::invalid_transition(
            &instance.name,
            command.verb(),
            state,
        )),
    }
}

impl From<DriverState> for InstanceState {
    fn from(state: DriverState) -> Self {
        match state {
            DriverState::Off => Self::Off,
            DriverState::Running => Self::Running,
            DriverState::Suspended => Self::Suspended,
        }
    }
}

/// A committed transient state waiting for its backend operation.
struct PendingOp {
    name: String,
    generation: u64,
    prior: InstanceState,
    op: Op,
    driver: Option<SharedDriver>,
    resources: ResourceSpec,
    backend_config: serde_json::Value,
}

pub(crate) struct Inner {
    config: DaemonConfig,
    registry: RwLock<Registry>,
    store: StateStore,
    vault: Arc<ImageVault>,
    platform: Arc<dyn Platform>,
    names: Box<dyn NameGenerator>,
    ssh_keys: Arc<dyn SshKeyProvider>,
    /// Health check failure recorded at startup.
    health: Option<String>,
    events: mpsc::UnboundedSender<DaemonEvent>,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The VM management daemon.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

impl Daemon {
    /// Build the platform, open the registry and vault, reconcile persisted
    /// instances against the backend and start the event loop.
    pub async fn new(config: DaemonConfig, parts: DaemonParts) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            DaemonError::PersistenceFailure(format!("{}: {e}", config.data_dir.display()))
        })?;

        let platform = parts.platform_factory.make_platform(&config.data_dir)?;
        let health = match platform.health_check().await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    backend = platform.name(),
                    error = %e,
                    "Backend health check failed, lifecycle commands disabled"
                );
                Some(e.to_string())
            }
        };

        let store = StateStore::open(config.data_dir.join("registry.db"))?;
        let vault = ImageVault::open(config.vault.clone(), parts.image_source).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            registry: RwLock::new(Registry::default()),
            store,
            vault,
            platform,
            names: parts.name_generator,
            ssh_keys: parts.ssh_keys,
            health,
            events: events_tx,
            event_loop: std::sync::Mutex::new(None),
        });

        inner.restore().await?;

        let handle = tokio::spawn(events::run(Arc::downgrade(&inner), events_rx));
        if let Ok(mut slot) = inner.event_loop.lock() {
            *slot = Some(handle);
        }

        info!(
            backend = inner.platform.name(),
            healthy = inner.health.is_none(),
            "Daemon started"
        );
        Ok(Self { inner })
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn backend_healthy(&self) -> bool {
        self.inner.health.is_none()
    }

    pub fn vault(&self) -> &Arc<ImageVault> {
        &self.inner.vault
    }

    /// Create and boot a new instance.
    pub async fn create(
        &self,
        request: CreateRequest,
        progress: Option<ProgressSink>,
    ) -> Result<InstanceInfo, DaemonError> {
        self.inner.create(request, progress).await
    }

    pub async fn start(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.inner.transition(name, Command::Start).await
    }

    pub async fn stop(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.inner.transition(name, Command::Stop).await
    }

    pub async fn suspend(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.inner.transition(name, Command::Suspend).await
    }

    pub async fn restart(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.inner.transition(name, Command::Restart).await
    }

    /// Move an instance to the trash, stopping it first. With `purge` the
    /// instance is destroyed right away.
    pub async fn trash(&self, name: &str, purge: bool) -> Result<InstanceInfo, DaemonError> {
        self.inner.trash(name, purge).await
    }

    /// Take an instance back out of the trash.
    pub async fn recover(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.inner.recover(name).await
    }

    /// Destroy trashed instances: the named ones, or all of them when
    /// `names` is empty.
    pub async fn purge(&self, names: &[String]) -> Result<Vec<InstanceInfo>, DaemonError> {
        self.inner.purge(names).await
    }

    pub async fn resize(
        &self,
        name: &str,
        request: ResizeRequest,
    ) -> Result<InstanceInfo, DaemonError> {
        self.inner.resize(name, request).await
    }

    pub async fn info(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        let registry = self.inner.registry.read().await;
        Ok(registry.get(name)?.to_info())
    }

    pub async fn list(&self) -> Vec<InstanceInfo> {
        let registry = self.inner.registry.read().await;
        registry.iter().map(Instance::to_info).collect()
    }

    pub async fn ssh_info(&self, name: &str) -> Result<SshInfo, DaemonError> {
        self.inner.ssh_info(name).await
    }

    /// Connection details for running `command` inside an instance.
    pub async fn exec(&self, name: &str, command: Vec<String>) -> Result<ExecInfo, DaemonError> {
        if command.is_empty() {
            return Err(DaemonError::Internal("no command given".to_string()));
        }
        let ssh = self.inner.ssh_info(name).await?;
        Ok(ExecInfo { ssh, command })
    }

    /// Check running instances for exits and late addresses.
    pub async fn reconcile(&self) {
        self.inner.reconcile().await
    }

    /// Flush the registry and stop the event loop.
    pub async fn shutdown(&self) {
        let registry = self.inner.registry.read().await;
        for instance in registry.iter() {
            if let Err(e) = self.inner.store.upsert_instance(&instance.to_record()) {
                error!(instance = %instance.name, error = %e, "Failed to flush instance");
            }
        }
        if let Ok(mut slot) = self.inner.event_loop.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        info!(instances = registry.len(), "Daemon shut down");
    }
}

fn report(progress: &Option<ProgressSink>, message: impl Into<String>) {
    if let Some(sink) = progress {
        let _ = sink.send(message.into());
    }
}

impl Inner {
    fn ensure_healthy(&self) -> Result<(), DaemonError> {
        match &self.health {
            Some(reason) => Err(DaemonError::BackendUnhealthy(reason.clone())),
            None => Ok(()),
        }
    }

    async fn create(
        self: &Arc<Self>,
        request: CreateRequest,
        progress: Option<ProgressSink>,
    ) -> Result<InstanceInfo, DaemonError> {
        request
            .resources
            .validate()
            .map_err(DaemonError::InvalidResources)?;
        let name = match request.name {
            Some(name) => name,
            None => self.names.make_name(),
        };
        validate_name(&name)?;
        self.ensure_healthy()?;

        let generation = {
            let mut registry = self.registry.write().await;
            if registry.contains(&name) {
                return Err(DaemonError::NameConflict(name));
            }
            let instance = Instance::reserve(name.clone(), request.image.clone(), request.resources);
            self.store.upsert_instance(&instance.to_record())?;
            let generation = instance.generation;
            registry.insert(instance);
            generation
        };

        info!(
            instance = %name,
            image = %request.image,
            cpus = request.resources.cpus,
            memory_mib = request.resources.memory_mib(),
            "Creating instance"
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match inner
                .provision(&name, &request.image, request.resources, &progress)
                .await
            {
                Ok(landing) => Outcome::Landed(landing),
                Err(error) => Outcome::Failed {
                    error,
                    fallback: None,
                },
            };
            let _ = inner.events.send(DaemonEvent::Completed {
                name,
                generation,
                outcome,
                reply: reply_tx,
            });
        });

        reply_rx
            .await
            .map_err(|_| DaemonError::Internal("create task ended without a result".to_string()))?
    }

    /// Fetch the image, create the backend VM and boot it.
    async fn provision(
        &self,
        name: &str,
        alias: &str,
        resources: ResourceSpec,
        progress: &Option<ProgressSink>,
    ) -> Result<Landing, DaemonError> {
        report(progress, format!("Retrieving image {alias}"));
        let image = self.vault.get(alias).await?;

        let result = async {
            let keys = self.ssh_keys.key_pair()?;
            let desc = VmDescription {
                name: name.to_string(),
                resources,
                image_path: image.path.clone(),
                image_hash: image.hash.clone(),
                ssh_public_key: keys.public_key,
            };

            report(progress, "Preparing instance");
            let mut driver = self.platform.create(&desc).await?;

            report(progress, "Starting instance");
            driver.start().await?;

            report(progress, "Waiting for network address");
            let address = self.await_address(name, &*driver).await;
            let exit = driver.exit_signal();
            let config = driver.config();

            Ok::<_, DaemonError>(Landing {
                state: InstanceState::Running,
                address,
                exit,
                config: Some(config),
                driver: Some(Arc::new(Mutex::new(driver))),
                image_hash: Some(image.hash.clone()),
                trash: false,
            })
        }
        .await;

        if let Err(e) = &result {
            warn!(instance = %name, error = %e, "Provisioning failed, cleaning up");
            self.vault.release(&image.hash).await;
            if let Err(e) = self.platform.remove_resources_for(name).await {
                warn!(instance = %name, error = %e, "Failed to remove resources of failed instance");
            }
        }
        result
    }

    async fn transition(
        self: &Arc<Self>,
        name: &str,
        command: Command,
    ) -> Result<InstanceInfo, DaemonError> {
        let pending = {
            let mut registry = self.registry.write().await;
            let instance = registry.get_mut(name)?;
            instance.ensure_idle()?;
            if instance.trashed {
                return Err(DaemonError::invalid_transition(name, command.verb(), "deleted"));
            }

            let Some((transient, op)) = plan(command, instance, &*self.platform)? else {
                debug!(instance = %name, state = %instance.state, "Nothing to do");
                return Ok(instance.to_info());
            };
            self.ensure_healthy()?;

            if matches!(op, Op::Start | Op::Restart { .. }) {
                if let Some(hash) = &instance.image_hash {
                    if !self.vault.contains(hash).await {
                        return Err(DaemonError::ImageNotFound(instance.image_alias.clone()));
                    }
                }
            }

            self.commit_transient(instance, transient, op)?
        };

        self.dispatch(pending).await
    }

    /// Phase 1: move `instance` into `transient` and persist it.
    fn commit_transient(
        &self,
        instance: &mut Instance,
        transient: InstanceState,
        op: Op,
    ) -> Result<PendingOp, DaemonError> {
        let prior = instance.state;
        let prior_address = instance.address;
        let generation = instance.commit(transient);

        if let Err(e) = self.store.upsert_instance(&instance.to_record()) {
            instance.commit(prior);
            instance.address = prior_address;
            return Err(e.into());
        }

        info!(
            instance = %instance.name,
            from = %prior,
            to = %transient,
            generation,
            "State transition"
        );

        Ok(PendingOp {
            name: instance.name.clone(),
            generation,
            prior,
            op,
            driver: instance.driver.clone(),
            resources: instance.resources,
            backend_config: instance.backend_config.clone(),
        })
    }

    /// Phase 2: run the backend operation in its own task and wait for the
    /// event loop to apply it.
    async fn dispatch(self: &Arc<Self>, pending: PendingOp) -> Result<InstanceInfo, DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let name = pending.name.clone();
            let generation = pending.generation;
            let outcome = inner.execute(pending).await;
            let _ = inner.events.send(DaemonEvent::Completed {
                name,
                generation,
                outcome,
                reply: reply_tx,
            });
        });

        reply_rx
            .await
            .map_err(|_| DaemonError::Internal("operation ended without a result".to_string()))?
    }

    async fn execute(&self, pending: PendingOp) -> Outcome {
        let driver = match &pending.driver {
            Some(driver) => Arc::clone(driver),
            None => match self
                .platform
                .load(&pending.name, &pending.resources, &pending.backend_config)
                .await
            {
                Ok(driver) => Arc::new(Mutex::new(driver)),
                Err(e) => {
                    return Outcome::Failed {
                        error: e.into(),
                        fallback: Some(Landing::at(pending.prior)),
                    }
                }
            },
        };

        let mut guard = driver.lock().await;
        let result = match pending.op {
            Op::Start => guard.start().await,
            Op::Resume => guard.resume().await,
            Op::Stop { .. } => guard.stop().await,
            Op::Suspend => guard.suspend().await,
            Op::Restart { was_running } => {
                let stopped = if was_running {
                    guard.stop().await
                } else {
                    Ok(())
                };
                match stopped {
                    Ok(()) => guard.start().await,
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => {
                let trash = matches!(pending.op, Op::Stop { trash: true });
                let mut landing = self
                    .land(&pending.name, pending.op.target(), &**guard, &driver, true)
                    .await;
                landing.trash = trash;
                Outcome::Landed(landing)
            }
            Err(e) => {
                let actual = InstanceState::from(guard.current_state().await);
                let fallback = self.land(&pending.name, actual, &**guard, &driver, false).await;
                Outcome::Failed {
                    error: e.into(),
                    fallback: Some(fallback),
                }
            }
        }
    }

    async fn land(
        &self,
        name: &str,
        state: InstanceState,
        driver: &dyn VmDriver,
        shared: &SharedDriver,
        wait_for_address: bool,
    ) -> Landing {
        let (address, exit) = if state == InstanceState::Running {
            let address = if wait_for_address {
                self.await_address(name, driver).await
            } else {
                driver.get_ip().await
            };
            (address, driver.exit_signal())
        } else {
            (None, None)
        };

        Landing {
            state,
            address,
            exit,
            config: Some(driver.config()),
            driver: Some(Arc::clone(shared)),
            image_hash: None,
            trash: false,
        }
    }

    /// Poll the driver for the guest address. The reconciler keeps looking
    /// after the timeout.
    async fn await_address(&self, name: &str, driver: &dyn VmDriver) -> Option<IpAddr> {
        let deadline = Instant::now() + self.config.address_timeout;
        loop {
            if let Some(address) = driver.get_ip().await {
                return Some(address);
            }
            if Instant::now() >= deadline {
                warn!(instance = %name, "Timed out waiting for instance address");
                return None;
            }
            tokio::time::sleep(self.config.address_poll_interval).await;
        }
    }

    async fn trash(self: &Arc<Self>, name: &str, purge: bool) -> Result<InstanceInfo, DaemonError> {
        let pending = {
            let mut registry = self.registry.write().await;
            let instance = registry.get_mut(name)?;
            instance.ensure_idle()?;

            if instance.trashed {
                None
            } else {
                match plan(Command::Trash, instance, &*self.platform)? {
                    Some((transient, op)) => {
                        self.ensure_healthy()?;
                        Some(self.commit_transient(instance, transient, op)?)
                    }
                    None => {
                        instance.trashed = true;
                        instance.commit(instance.state);
                        if let Err(e) = self.store.upsert_instance(&instance.to_record()) {
                            instance.trashed = false;
                            return Err(e.into());
                        }
                        info!(instance = %name, "Instance moved to trash");
                        None
                    }
                }
            }
        };

        let info = match pending {
            Some(pending) => self.dispatch(pending).await?,
            None => self.registry.read().await.get(name)?.to_info(),
        };

        if purge {
            let mut purged = self.purge(&[name.to_string()]).await?;
            return purged
                .pop()
                .ok_or_else(|| DaemonError::NameUnknown(name.to_string()));
        }
        Ok(info)
    }

    async fn recover(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        let mut registry = self.registry.write().await;
        let instance = registry.get_mut(name)?;
        instance.ensure_idle()?;

        if instance.trashed {
            instance.trashed = false;
            instance.commit(instance.state);
            if let Err(e) = self.store.upsert_instance(&instance.to_record()) {
                instance.trashed = true;
                return Err(e.into());
            }
            info!(instance = %name, "Instance recovered from trash");
        }
        Ok(instance.to_info())
    }

    async fn purge(&self, names: &[String]) -> Result<Vec<InstanceInfo>, DaemonError> {
        let (purged, failure) = {
            let mut registry = self.registry.write().await;

            let targets: Vec<String> = if names.is_empty() {
                registry
                    .iter()
                    .filter(|i| i.trashed && !i.is_busy())
                    .map(|i| i.name.clone())
                    .collect()
            } else {
                let mut targets = Vec::new();
                for name in names {
                    let instance = registry.get(name)?;
                    instance.ensure_idle()?;
                    if !instance.trashed {
                        return Err(DaemonError::invalid_transition(
                            name,
                            "purge",
                            instance.state,
                        ));
                    }
                    if !targets.contains(name) {
                        targets.push(name.clone());
                    }
                }
                targets
            };

            let mut purged = Vec::new();
            let mut failure = None;
            for name in targets {
                if let Err(e) = self.store.delete_instance(&name) {
                    failure = Some(e);
                    break;
                }
                if let Some(mut instance) = registry.remove(&name) {
                    instance.commit(InstanceState::Deleted);
                    purged.push(instance);
                }
            }
            (purged, failure)
        };

        for instance in &purged {
            if let Err(e) = self.platform.remove_resources_for(&instance.name).await {
                warn!(instance = %instance.name, error = %e, "Failed to remove instance resources");
            }
            if let Some(hash) = &instance.image_hash {
                self.vault.release(hash).await;
            }
            info!(instance = %instance.name, "Instance purged");
        }

        if let Err(e) = self.vault.prune().await {
            warn!(error = %e, "Failed to prune image vault");
        }

        if let Some(e) = failure {
            return Err(e.into());
        }
        Ok(purged.iter().map(Instance::to_info).collect())
    }

    async fn resize(&self, name: &str, request: ResizeRequest) -> Result<InstanceInfo, DaemonError> {
        let (current, resources, driver, backend_config) = {
            let mut registry = self.registry.write().await;
            let instance = registry.get_mut(name)?;
            instance.ensure_idle()?;
            if instance.trashed {
                return Err(DaemonError::invalid_transition(name, "resize", "deleted"));
            }
            if instance.state != InstanceState::Off {
                return Err(DaemonError::invalid_transition(name, "resize", instance.state));
            }

            let current = instance.resources;
            let resources = ResourceSpec {
                cpus: request.cpus.unwrap_or(current.cpus),
                memory_bytes: request.memory_bytes.unwrap_or(current.memory_bytes),
                disk_bytes: request.disk_bytes.unwrap_or(current.disk_bytes),
            };
            resources.validate().map_err(DaemonError::InvalidResources)?;
            if resources.disk_bytes < current.disk_bytes {
                return Err(DaemonError::InvalidResources(
                    "disk size can only grow".to_string(),
                ));
            }
            if resources == current {
                return Ok(instance.to_info());
            }
            self.ensure_healthy()?;

            // Gates other commands while the lock is released
            instance.resizing = true;
            (
                current,
                resources,
                instance.driver.clone(),
                instance.backend_config.clone(),
            )
        };

        let resized = self
            .resize_driver(name, &current, &resources, driver, &backend_config)
            .await;

        let mut registry = self.registry.write().await;
        let instance = registry.get_mut(name)?;
        instance.resizing = false;
        let (driver, config) = resized?;

        instance.resources = resources;
        instance.backend_config = config;
        instance.driver = Some(driver);
        instance.commit(instance.state);
        self.store.upsert_instance(&instance.to_record())?;

        info!(
            instance = %name,
            cpus = resources.cpus,
            memory_mib = resources.memory_mib(),
            disk_bytes = resources.disk_bytes,
            "Instance resized"
        );
        Ok(instance.to_info())
    }

    async fn resize_driver(
        &self,
        name: &str,
        current: &ResourceSpec,
        resources: &ResourceSpec,
        driver: Option<SharedDriver>,
        backend_config: &serde_json::Value,
    ) -> Result<(SharedDriver, serde_json::Value), DaemonError> {
        let driver = match driver {
            Some(driver) => driver,
            None => Arc::new(Mutex::new(
                self.platform.load(name, current, backend_config).await?,
            )),
        };
        let config = {
            let mut guard = driver.lock().await;
            guard.resize(resources).await?;
            guard.config()
        };
        Ok((driver, config))
    }

    async fn ssh_info(&self, name: &str) -> Result<SshInfo, DaemonError> {
        let host = {
            let registry = self.registry.read().await;
            let instance = registry.get(name)?;
            instance.ensure_idle()?;
            if instance.trashed {
                return Err(DaemonError::invalid_transition(name, "connect to", "deleted"));
            }
            if instance.state != InstanceState::Running {
                return Err(DaemonError::invalid_transition(
                    name,
                    "connect to",
                    instance.state,
                ));
            }
            // Still booting as far as the client is concerned
            instance
                .address
                .ok_or_else(|| DaemonError::OperationInProgress {
                    name: name.to_string(),
                    state: instance.state,
                })?
        };

        let keys = self.ssh_keys.key_pair()?;
        Ok(SshInfo {
            host: host.to_string(),
            port: 22,
            username: self.config.ssh_username.clone(),
            private_key_base64: base64::engine::general_purpose::STANDARD.encode(keys.private_key),
        })
    }

    async fn reconcile(&self) {
        let targets: Vec<(String, u64, SharedDriver, bool)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .filter(|i| i.state == InstanceState::Running)
                .filter_map(|i| {
                    i.driver
                        .as_ref()
                        .map(|d| (i.name.clone(), i.generation, Arc::clone(d), i.address.is_none()))
                })
                .collect()
        };

        for (name, generation, driver, needs_address) in targets {
            // Busy drivers belong to an operation that reports for itself
            let Ok(guard) = driver.try_lock() else {
                continue;
            };

            match guard.current_state().await {
                DriverState::Running => {
                    if needs_address {
                        if let Some(address) = guard.get_ip().await {
                            let _ = self.events.send(DaemonEvent::AddressResolved {
                                name,
                                generation,
                                address,
                            });
                        }
                    }
                }
                state => {
                    debug!(instance = %name, state = ?state, "Reconcile found instance not running");
                    let _ = self
                        .events
                        .send(DaemonEvent::ProcessExited { name, generation });
                }
            }
        }
    }

    /// Rebuild the registry from the store, trusting the backend's view of
    /// each instance over the recorded state.
    async fn restore(&self) -> Result<(), DaemonError> {
        let records = self.store.list_instances()?;
        let mut registry = self.registry.write().await;

        for record in records {
            if record.image_hash.is_none() || record.backend_config.is_null() {
                warn!(
                    instance = %record.name,
                    state = %record.state,
                    "Discarding instance whose creation was interrupted"
                );
                self.store.delete_instance(&record.name)?;
                if let Err(e) = self.platform.remove_resources_for(&record.name).await {
                    warn!(instance = %record.name, error = %e, "Failed to remove leftover resources");
                }
                continue;
            }

            let mut instance = Instance::from_record(record);
            let mut exit = None;
            let actual = match self
                .platform
                .load(&instance.name, &instance.resources, &instance.backend_config)
                .await
            {
                Ok(driver) => {
                    let state = InstanceState::from(driver.current_state().await);
                    if state == InstanceState::Running {
                        exit = driver.exit_signal();
                        if let Some(address) = driver.get_ip().await {
                            instance.address = Some(address);
                        }
                    }
                    instance.driver = Some(Arc::new(Mutex::new(driver)));
                    state
                }
                Err(e) => {
                    warn!(
                        instance = %instance.name,
                        error = %e,
                        "Failed to re-attach backend, treating instance as off"
                    );
                    InstanceState::Off
                }
            };

            if actual != instance.state {
                info!(
                    instance = %instance.name,
                    recorded = %instance.state,
                    actual = %actual,
                    "Reconciled instance state with backend"
                );
                let address = instance.address;
                instance.commit(actual);
                if actual == InstanceState::Running {
                    instance.address = address;
                }
            }

            if let Some(exit) = exit {
                self.watch_exit(instance.name.clone(), instance.generation, exit);
            }

            if let Some(hash) = &instance.image_hash {
                if !self.vault.retain(hash).await {
                    warn!(instance = %instance.name, hash = %hash, "Instance image missing from vault");
                }
            }

            self.store.upsert_instance(&instance.to_record())?;
            registry.insert(instance);
        }

        info!(instances = registry.len(), "Registry restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;

    fn instance(state: InstanceState) -> Instance {
        let mut instance =
            Instance::reserve("foo".to_string(), "noble".to_string(), ResourceSpec::default());
        instance.state = state;
        instance
    }

    #[test]
    fn test_plan_transitions() {
        let platform = MockPlatform::new();

        let planned = plan(Command::Start, &instance(InstanceState::Off), &platform).unwrap();
        assert_eq!(planned, Some((InstanceState::Starting, Op::Start)));

        let planned = plan(Command::Start, &instance(InstanceState::Suspended), &platform).unwrap();
        assert_eq!(planned, Some((InstanceState::Starting, Op::Resume)));

        let planned = plan(Command::Restart, &instance(InstanceState::Off), &platform).unwrap();
        assert_eq!(
            planned,
            Some((InstanceState::Restarting, Op::Restart { was_running: false }))
        );

        let planned = plan(Command::Trash, &instance(InstanceState::Running), &platform).unwrap();
        assert_eq!(planned, Some((InstanceState::Stopping, Op::Stop { trash: true })));
    }

    #[test]
    fn test_plan_noops() {
        let platform = MockPlatform::new();
        assert_eq!(plan(Command::Stop, &instance(InstanceState::Off), &platform).unwrap(), None);
        assert_eq!(
            plan(Command::Start, &instance(InstanceState::Running), &platform).unwrap(),
            None
        );
        assert_eq!(
            plan(Command::Suspend, &instance(InstanceState::Suspended), &platform).unwrap(),
            None
        );
    }

    #[test]
    fn test_plan_rejections() {
        let platform = MockPlatform::new();
        assert!(matches!(
            plan(Command::Suspend, &instance(InstanceState::Off), &platform),
            Err(DaemonError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            plan(Command::Restart, &instance(InstanceState::Suspended), &platform),
            Err(DaemonError::InvalidStateTransition { .. })
        ));

        let no_suspend = MockPlatform::without_suspend();
        assert!(matches!(
            plan(Command::Suspend, &instance(InstanceState::Running), &no_suspend),
            Err(DaemonError::Unsupported(_))
        ));
    }

    #[test]
    fn test_op_targets() {
        assert_eq!(Op::Resume.target(), InstanceState::Running);
        assert_eq!(Op::Stop { trash: true }.target(), InstanceState::Off);
        assert_eq!(Op::Suspend.target(), InstanceState::Suspended);
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateRequest = serde_json::from_str(r#"{"resources": {"cpus": 2}}"#).unwrap();
        assert_eq!(request.name, None);
        assert_eq!(request.image, "default");
        assert_eq!(request.resources.cpus, 2);
        assert_eq!(request.resources.memory_bytes, ResourceSpec::default().memory_bytes);
    }
}
