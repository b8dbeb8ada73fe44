#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;
use vmpilot::{
    builder::{
        options::{HubOptionsBuilder, InstallPolicy},
        platform::PlatformLimits,
        Builder, DeviceConfiguration,
    },
    catalog::MemoryCatalog,
    engine::{Engine, EngineError, MachineEvent, MachineEvents},
    host::{Host, InstallMediaSource, StaticInstallMedia},
    GuestKind, InstanceController, InstanceEvent, InstanceState, VmProfile,
};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct Calls {
    validated: usize,
    instantiated: Vec<DeviceConfiguration>,
    started: usize,
    stopped: usize,
    events: Vec<MachineEvents>,
}

/// Engine recording what the controllers ask of it
#[derive(Debug)]
pub struct FakeEngine {
    limits: PlatformLimits,
    reject: Option<String>,
    fail_start: Option<String>,
    fail_stop: Option<String>,
    hang_start: bool,
    stop_gate: Option<Notify>,
    calls: Mutex<Calls>,
}

#[derive(Debug)]
pub struct FakeMachine {
    pub index: usize,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        FakeEngine {
            limits: PlatformLimits::new(1, 16, 256 * MIB, 16 * GIB),
            reject: None,
            fail_start: None,
            fail_stop: None,
            hang_start: false,
            stop_gate: None,
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn with_limits(mut self, limits: PlatformLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn rejecting(mut self, reason: &str) -> Self {
        self.reject = Some(reason.to_string());
        self
    }

    pub fn failing_start(mut self, reason: &str) -> Self {
        self.fail_start = Some(reason.to_string());
        self
    }

    pub fn failing_stop(mut self, reason: &str) -> Self {
        self.fail_stop = Some(reason.to_string());
        self
    }

    /// `start` never completes
    pub fn hanging_start(mut self) -> Self {
        self.hang_start = true;
        self
    }

    /// `stop` waits for [Self::release_stop]
    pub fn gated_stop(mut self) -> Self {
        self.stop_gate = Some(Notify::new());
        self
    }

    pub fn release_stop(&self) {
        if let Some(gate) = &self.stop_gate {
            gate.notify_one();
        }
    }

    pub fn validate_count(&self) -> usize {
        self.calls.lock().unwrap().validated
    }

    pub fn configs(&self) -> Vec<DeviceConfiguration> {
        self.calls.lock().unwrap().instantiated.clone()
    }

    pub fn start_count(&self) -> usize {
        self.calls.lock().unwrap().started
    }

    pub fn stop_count(&self) -> usize {
        self.calls.lock().unwrap().stopped
    }

    /// Send a callback about the `index`-th instantiated machine
    pub fn emit(&self, index: usize, event: MachineEvent) {
        self.calls.lock().unwrap().events[index]
            .send(event)
            .unwrap();
    }

    /// Drop the event channel of the `index`-th machine
    pub fn disconnect(&self, index: usize) {
        let mut calls = self.calls.lock().unwrap();
        let (sender, _) = tokio::sync::mpsc::unbounded_channel();
        calls.events[index] = sender;
    }
}

#[async_trait]
impl Engine for FakeEngine {
    type Machine = FakeMachine;

    fn limits(&self) -> PlatformLimits {
        self.limits
    }

    fn validate(&self, _config: &DeviceConfiguration) -> Result<(), EngineError> {
        self.calls.lock().unwrap().validated += 1;
        match &self.reject {
            Some(reason) => Err(EngineError::Invalid(reason.clone())),
            None => Ok(()),
        }
    }

    fn instantiate(
        &self,
        config: DeviceConfiguration,
        events: MachineEvents,
    ) -> Result<FakeMachine, EngineError> {
        let mut calls = self.calls.lock().unwrap();
        calls.instantiated.push(config);
        calls.events.push(events);
        Ok(FakeMachine {
            index: calls.events.len() - 1,
        })
    }

    async fn start(&self, _machine: &FakeMachine) -> Result<(), EngineError> {
        self.calls.lock().unwrap().started += 1;
        if self.hang_start {
            std::future::pending::<()>().await;
        }
        match &self.fail_start {
            Some(reason) => Err(EngineError::Start(reason.clone())),
            None => Ok(()),
        }
    }

    async fn stop(&self, _machine: &FakeMachine) -> Result<(), EngineError> {
        self.calls.lock().unwrap().stopped += 1;
        if let Some(gate) = &self.stop_gate {
            gate.notified().await;
        }
        match &self.fail_stop {
            Some(reason) => Err(EngineError::Stop(reason.clone())),
            None => Ok(()),
        }
    }
}

pub fn install_media(dir: &Path) -> PathBuf {
    let iso = dir.join("installer.iso");
    std::fs::write(&iso, b"iso").unwrap();
    iso
}

pub fn host_with(
    bundle_dir: &Path,
    engine: FakeEngine,
    install_media: impl InstallMediaSource + 'static,
    install_policy: InstallPolicy,
) -> Arc<Host<FakeEngine>> {
    let options = HubOptionsBuilder::new()
        .with_bundle_dir(bundle_dir.to_path_buf())
        .with_install_policy(install_policy)
        .try_build()
        .unwrap();
    Arc::new(Host::new(
        Arc::new(engine),
        Arc::new(MemoryCatalog::new()),
        Arc::new(install_media),
        options,
    ))
}

/// Host with an install media picked every time and the default policy
pub fn host(bundle_dir: &Path, engine: FakeEngine) -> Arc<Host<FakeEngine>> {
    let iso = install_media(bundle_dir);
    host_with(
        bundle_dir,
        engine,
        StaticInstallMedia::new(iso),
        InstallPolicy::default(),
    )
}

pub fn linux_profile(host: &Host<FakeEngine>, name: &str) -> VmProfile {
    host.create_profile(name.to_string(), GuestKind::Linux, 2, GIB, 16 * MIB)
        .unwrap()
}

/// Wait until the controller reaches `state` or a terminal state
pub async fn settle(
    controller: &InstanceController<FakeEngine>,
    state: InstanceState,
) -> InstanceState {
    let mut states = controller.watch_state();
    let reached = tokio::time::timeout(TIMEOUT, states.wait_for(|s| *s == state || s.is_terminal()))
        .await
        .expect("controller did not settle in time")
        .map(|s| *s);
    reached.unwrap()
}

pub async fn terminal(controller: &InstanceController<FakeEngine>) -> InstanceState {
    tokio::time::timeout(TIMEOUT, controller.wait_terminal())
        .await
        .expect("controller did not terminate in time")
}

/// Events received until the channel lags or closes, or `until` matches
pub async fn collect_events(
    events: &mut tokio::sync::broadcast::Receiver<InstanceEvent>,
    until: impl Fn(&InstanceEvent) -> bool,
) -> Vec<InstanceEvent> {
    let mut received = vec![];
    loop {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("no event received in time");
        match event {
            Ok(event) => {
                let done = until(&event);
                received.push(event);
                if done {
                    return received;
                }
            }
            Err(_) => return received,
        }
    }
}
