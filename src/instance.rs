//! # Lifecycle of one VM instance
//!
//! An [InstanceController] drives a single VM from its profile to a running
//! machine and back. The work happens in a dedicated task spawned by
//! [InstanceController::launch], so every transition of an instance is
//! serialized while different instances progress concurrently.
//!
//! ```text
//! Idle -> Configuring -> Starting -> Running -> Stopping -> Stopped
//!             |              |          |
//!             +--------------+----------+------> Failed
//! ```
//!
//! `Stopped` and `Failed` are terminal. A failure only ever affects the
//! instance it happened in: the catalog entry and the files already written
//! to the bundle are left as they are.
//!
//! ## Example
//!
//! ```ignore
//! let controller = InstanceController::new(profile, host);
//! let mut events = controller.subscribe();
//! controller.launch()?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    builder::{
        options::InstallPolicy, Builder, BuilderError, DeviceConfigBuilder, DeviceConfiguration,
    },
    bundle::BundleError,
    engine::{Engine, MachineEvent},
    host::Host,
    profile::{VmId, VmProfile},
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Idle,
    Configuring,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Idle => "idle",
            InstanceState::Configuring => "configuring",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of a launch an error comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    BundleCreation,
    DiskAllocation,
    BootState,
    InstallMedia,
    Configuration,
    EngineStart,
    Runtime,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LaunchStage::BundleCreation => "bundle creation",
            LaunchStage::DiskAllocation => "disk allocation",
            LaunchStage::BootState => "identity and firmware loading",
            LaunchStage::InstallMedia => "install media selection",
            LaunchStage::Configuration => "configuration validation",
            LaunchStage::EngineStart => "engine start",
            LaunchStage::Runtime => "runtime",
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("Could not create the VM bundle, reason: {0}")]
    BundleCreate(String),
    #[error("Could not allocate the main disk image, reason: {0}")]
    DiskAllocation(String),
    #[error("Machine identifier not found at {0}")]
    IdentityNotFound(String),
    #[error("Machine identifier is corrupt, reason: {0}")]
    IdentityCorrupt(String),
    #[error("Firmware state is corrupt, reason: {0}")]
    FirmwareCorrupt(String),
    #[error("VM is installed but its persisted state is missing: {0}")]
    MissingState(String),
    #[error("Could not access VM state, reason: {0}")]
    Storage(String),
    #[error("No install media was selected")]
    InstallMediaNotSelected,
    #[error("Invalid VM configuration, reason: {0}")]
    ConfigInvalid(String),
    #[error("Could not start the machine, reason: {0}")]
    EngineStart(String),
    #[error("Could not stop the machine, reason: {0}")]
    EngineStop(String),
    #[error("Machine stopped unexpectedly, reason: {0}")]
    EngineRuntime(String),
    #[error("Background work was interrupted during {0}, reason: {1}")]
    Interrupted(LaunchStage, String),
    #[error("Instance was already launched")]
    AlreadyLaunched,
}

impl InstanceError {
    pub fn stage(&self) -> LaunchStage {
        match self {
            InstanceError::BundleCreate(_) => LaunchStage::BundleCreation,
            InstanceError::DiskAllocation(_) => LaunchStage::DiskAllocation,
            InstanceError::IdentityNotFound(_)
            | InstanceError::IdentityCorrupt(_)
            | InstanceError::FirmwareCorrupt(_)
            | InstanceError::MissingState(_)
            | InstanceError::Storage(_) => LaunchStage::BootState,
            InstanceError::Interrupted(stage, _) => *stage,
            InstanceError::InstallMediaNotSelected => LaunchStage::InstallMedia,
            InstanceError::ConfigInvalid(_) => LaunchStage::Configuration,
            InstanceError::EngineStart(_) | InstanceError::AlreadyLaunched => {
                LaunchStage::EngineStart
            }
            InstanceError::EngineStop(_) | InstanceError::EngineRuntime(_) => LaunchStage::Runtime,
        }
    }
}

impl From<BundleError> for InstanceError {
    fn from(e: BundleError) -> InstanceError {
        match e {
            BundleError::Create(path, e) => {
                InstanceError::BundleCreate(format!("{}: {}", path.display(), e))
            }
            BundleError::DiskAllocation(path, e) => {
                InstanceError::DiskAllocation(format!("{}: {}", path.display(), e))
            }
            BundleError::IdentityNotFound(path) => {
                InstanceError::IdentityNotFound(path.display().to_string())
            }
            BundleError::IdentityCorrupt(path, reason) => {
                InstanceError::IdentityCorrupt(format!("{}: {}", path.display(), reason))
            }
            BundleError::FirmwareNotFound(path) => {
                InstanceError::MissingState(path.display().to_string())
            }
            BundleError::FirmwareCorrupt(path, reason) => {
                InstanceError::FirmwareCorrupt(format!("{}: {}", path.display(), reason))
            }
            BundleError::MissingState(paths) => InstanceError::MissingState(
                paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            e @ (BundleError::Io(..) | BundleError::Remove(..)) => {
                InstanceError::Storage(e.to_string())
            }
        }
    }
}

impl From<BuilderError> for InstanceError {
    fn from(e: BuilderError) -> InstanceError {
        InstanceError::ConfigInvalid(e.to_string())
    }
}

/// What observers of an instance are told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    StateChanged(InstanceState),
    Failed(InstanceError),
    /// Reported while the instance keeps running
    NetworkDisconnected(String),
}

pub(crate) type TerminalHook = Box<dyn FnOnce() + Send>;

struct Shared<E: Engine> {
    /// Distinguishes successive controllers of the same VM
    instance_id: Uuid,
    identity: VmId,
    host: Arc<Host<E>>,
    profile: Mutex<VmProfile>,
    state: watch::Sender<InstanceState>,
    events: broadcast::Sender<InstanceEvent>,
    error: Mutex<Option<InstanceError>>,
    shutdown: CancellationToken,
    launched: AtomicBool,
    on_terminal: Mutex<Option<TerminalHook>>,
}

/// Handle on one VM instance, clones share the same instance
pub struct InstanceController<E: Engine> {
    shared: Arc<Shared<E>>,
}

impl<E: Engine> Clone for InstanceController<E> {
    fn clone(&self) -> Self {
        InstanceController {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Engine> fmt::Debug for InstanceController<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceController")
            .field("instance_id", &self.shared.instance_id)
            .field("identity", &self.shared.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl<E: Engine> InstanceController<E> {
    pub fn new(profile: VmProfile, host: Arc<Host<E>>) -> Self {
        let (state, _) = watch::channel(InstanceState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        InstanceController {
            shared: Arc::new(Shared {
                instance_id: Uuid::new_v4(),
                identity: profile.identity(),
                host,
                profile: Mutex::new(profile),
                state,
                events,
                error: Mutex::new(None),
                shutdown: CancellationToken::new(),
                launched: AtomicBool::new(false),
                on_terminal: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` once, right after the instance reaches a terminal state
    pub(crate) fn on_terminal(&self, hook: TerminalHook) {
        *lock(&self.shared.on_terminal) = Some(hook);
    }

    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    pub fn identity(&self) -> VmId {
        self.shared.identity
    }

    /// Current profile, `needs_install` is updated once the install completes
    pub fn profile(&self) -> VmProfile {
        self.shared.profile()
    }

    pub fn state(&self) -> InstanceState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.shared.events.subscribe()
    }

    /// Error which made the instance fail, it can only be taken once
    pub fn take_error(&self) -> Option<InstanceError> {
        lock(&self.shared.error).take()
    }

    /// Whether both handles point to the same instance
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Start driving the instance, it must be called from a tokio runtime.
    ///
    /// The call returns once the instance is `Configuring`, progress is
    /// reported through [Self::subscribe] and [Self::watch_state].
    #[instrument(skip(self), fields(id = %self.shared.identity))]
    pub fn launch(&self) -> Result<(), InstanceError> {
        if self.shared.launched.swap(true, Ordering::SeqCst) {
            return Err(InstanceError::AlreadyLaunched);
        }
        info!("Launching instance {}", self.shared.instance_id);
        self.shared.transition(InstanceState::Configuring);
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.drive().await });
        Ok(())
    }

    /// Request the instance to stop.
    ///
    /// A running machine is stopped through the engine, a launch in progress
    /// is abandoned. An instance which was never launched stops immediately.
    #[instrument(skip(self), fields(id = %self.shared.identity))]
    pub fn stop(&self) {
        if !self.shared.launched.swap(true, Ordering::SeqCst) {
            info!("Instance stopped before being launched");
            self.shared.finish(Ok(()));
            return;
        }
        debug!("Stop requested");
        self.shared.shutdown.cancel();
    }

    /// Wait until the instance is `Stopped` or `Failed`
    pub async fn wait_terminal(&self) -> InstanceState {
        let mut states = self.watch_state();
        let reached = match states.wait_for(InstanceState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run blocking bundle work of `stage` on the blocking pool
async fn blocking<T, F>(stage: LaunchStage, work: F) -> Result<T, InstanceError>
where
    F: FnOnce() -> Result<T, BundleError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| InstanceError::Interrupted(stage, e.to_string()))?
        .map_err(InstanceError::from)
}

impl<E: Engine> Shared<E> {
    fn profile(&self) -> VmProfile {
        lock(&self.profile).clone()
    }

    fn transition(&self, next: InstanceState) {
        let previous = self.state.send_replace(next);
        debug!("State {} -> {}", previous, next);
        let _ = self.events.send(InstanceEvent::StateChanged(next));
    }

    fn finish(&self, outcome: Result<(), InstanceError>) {
        match outcome {
            Ok(()) => {
                info!("Instance stopped");
                self.transition(InstanceState::Stopped);
            }
            Err(e) => {
                error!("Instance failed during {}: {}", e.stage(), e);
                *lock(&self.error) = Some(e.clone());
                let _ = self.events.send(InstanceEvent::Failed(e));
                self.transition(InstanceState::Failed);
            }
        }

        let hook = lock(&self.on_terminal).take();
        if let Some(hook) = hook {
            hook();
        }
    }

    #[instrument(skip_all, fields(id = %self.identity))]
    async fn drive(self: Arc<Self>) {
        let outcome = self.run().await;
        self.finish(outcome);
    }

    /// Profile to launch with, an install completed by an earlier instance
    /// is taken from the catalog
    fn refresh_profile(&self) -> VmProfile {
        let stored = match self.host.catalog.get(&self.identity) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not refresh profile from the catalog: {}", e);
                return self.profile();
            }
        };
        let mut profile = lock(&self.profile);
        if profile.needs_install() && !stored.needs_install() {
            debug!("Catalog records the install as complete");
            profile.mark_installed();
        }
        profile.clone()
    }

    async fn run(&self) -> Result<(), InstanceError> {
        let profile = self.refresh_profile();
        let install_run = profile.needs_install();
        let engine = self.host.engine.clone();

        let config = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Launch cancelled while configuring");
                return Ok(());
            }
            config = self.configure(profile) => config?,
        };

        self.transition(InstanceState::Starting);
        let (events, mut machine_events) = mpsc::unbounded_channel();
        let machine = engine
            .instantiate(config, events)
            .map_err(|e| InstanceError::EngineStart(e.to_string()))?;

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Launch cancelled while starting");
                self.transition(InstanceState::Stopping);
                if let Err(e) = engine.stop(&machine).await {
                    warn!("Could not stop the machine of a cancelled launch: {}", e);
                }
                return Ok(());
            }
            started = engine.start(&machine) => {
                started.map_err(|e| InstanceError::EngineStart(e.to_string()))?
            }
        }

        self.transition(InstanceState::Running);
        info!("Virtual machine successfully started");
        let install_policy = self.host.options.install_policy;
        if install_run && install_policy == InstallPolicy::FirstBoot {
            self.mark_installed();
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.transition(InstanceState::Stopping);
                    return engine
                        .stop(&machine)
                        .await
                        .map_err(|e| InstanceError::EngineStop(e.to_string()));
                }
                event = machine_events.recv() => match event {
                    Some(MachineEvent::NetworkDisconnected(reason)) => {
                        warn!("Network attachment was disconnected: {}", reason);
                        let _ = self.events.send(InstanceEvent::NetworkDisconnected(reason));
                    }
                    Some(MachineEvent::GuestDidStop) => {
                        info!("Guest did stop the virtual machine");
                        self.transition(InstanceState::Stopping);
                        if install_run && install_policy == InstallPolicy::GuestShutdown {
                            self.mark_installed();
                        }
                        return Ok(());
                    }
                    Some(MachineEvent::DidStop(None)) | None => {
                        info!("Virtual machine did stop");
                        self.transition(InstanceState::Stopping);
                        return Ok(());
                    }
                    Some(MachineEvent::DidStop(Some(reason))) => {
                        return Err(InstanceError::EngineRuntime(reason));
                    }
                }
            }
        }
    }

    /// Prepare the bundle and the boot state, then build and validate the
    /// device configuration.
    ///
    /// 1. Install run: provision the bundle, pick the install media and
    ///    create the boot state
    /// 2. Resume run: load the boot state saved by the install run
    /// 3. Build the configuration and have the engine validate it
    async fn configure(&self, profile: VmProfile) -> Result<DeviceConfiguration, InstanceError> {
        let store = self.host.store.clone();
        let (boot_state, install_media) = if profile.needs_install() {
            let (provisioned, bundle_store) = (profile.clone(), store.clone());
            blocking(LaunchStage::BundleCreation, move || {
                bundle_store.provision(&provisioned)
            })
            .await?;

            let install_media = self
                .host
                .install_media
                .pick(&profile)
                .await
                .ok_or(InstanceError::InstallMediaNotSelected)?;
            debug!("Install media: {}", install_media.display());

            let installed = profile.clone();
            let boot_state =
                blocking(LaunchStage::BootState, move || store.create_boot_state(&installed))
                    .await?;
            (boot_state, Some(install_media))
        } else {
            let resumed = profile.clone();
            let boot_state =
                blocking(LaunchStage::BootState, move || store.load_boot_state(&resumed)).await?;
            (boot_state, None)
        };

        let mut builder = DeviceConfigBuilder::new(self.host.engine.limits())
            .with_options(&self.host.options)
            .with_profile(profile)
            .with_boot_state(boot_state);
        if let Some(install_media) = install_media {
            builder = builder.with_install_media(install_media);
        }
        let config = builder.try_build()?;
        trace!("Device configuration: {:#?}", config);

        self.host
            .engine
            .validate(&config)
            .map_err(|e| InstanceError::ConfigInvalid(e.to_string()))?;
        Ok(config)
    }

    fn mark_installed(&self) {
        let profile = {
            let mut profile = lock(&self.profile);
            profile.mark_installed();
            profile.clone()
        };
        info!("Install completed, install media will not be attached anymore");
        if let Err(e) = self.host.catalog.update(&profile) {
            warn!("Could not persist install completion: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, path::PathBuf};

    use super::*;

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = [
            InstanceState::Idle,
            InstanceState::Configuring,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Stopped,
            InstanceState::Failed,
        ]
        .into_iter()
        .filter(InstanceState::is_terminal)
        .collect();
        assert_eq!(terminal, vec![InstanceState::Stopped, InstanceState::Failed]);
    }

    #[test]
    fn bundle_errors_keep_their_stage() {
        let disk = InstanceError::from(BundleError::DiskAllocation(
            PathBuf::from("/vm.bundle/Disk.img"),
            io::Error::new(io::ErrorKind::Other, "no space left"),
        ));
        assert_eq!(disk.stage(), LaunchStage::DiskAllocation);

        let create = InstanceError::from(BundleError::Create(
            PathBuf::from("/vm.bundle"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        ));
        assert_eq!(create.stage(), LaunchStage::BundleCreation);
    }

    #[test]
    fn missing_state_lists_files() {
        let e = InstanceError::from(BundleError::MissingState(vec![
            PathBuf::from("/vm.bundle/MachineIdentifier"),
            PathBuf::from("/vm.bundle/NVRAM"),
        ]));
        assert_eq!(
            e,
            InstanceError::MissingState(
                "/vm.bundle/MachineIdentifier, /vm.bundle/NVRAM".to_string()
            )
        );
        assert_eq!(e.stage(), LaunchStage::BootState);
    }

    #[test]
    fn builder_errors_are_invalid_configurations() {
        let e = InstanceError::from(BuilderError::MissingRequiredField("install_media".into()));
        assert_eq!(e.stage(), LaunchStage::Configuration);
    }

    #[tokio::test]
    async fn interrupted_work_keeps_its_stage() {
        let result: Result<(), InstanceError> =
            blocking(LaunchStage::BundleCreation, || -> Result<(), BundleError> {
                panic!("allocation aborted")
            })
            .await;
        let error = result.unwrap_err();
        assert!(matches!(
            error,
            InstanceError::Interrupted(LaunchStage::BundleCreation, _)
        ));
        assert_eq!(error.stage(), LaunchStage::BundleCreation);
    }
}
