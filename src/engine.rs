//! # Virtualization engine contract
//!
//! The engine is the component that actually runs virtual machines. This
//! crate never talks to a hypervisor directly, every VM goes through an
//! [Engine] implementation.
//!
//! ## Design
//!
//! An engine validates a [DeviceConfiguration], turns it into a machine, and
//! starts or stops that machine asynchronously. Whatever happens to the
//! machine afterwards is reported through the [MachineEvents] sender handed to
//! [Engine::instantiate]: each machine gets its own channel, so concurrent
//! machines never share an event sink.
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::builder::{platform::PlatformLimits, DeviceConfiguration};

/// Callbacks delivered by the engine for one machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    /// The machine stopped, with the reason when it was not requested
    DidStop(Option<String>),
    /// The guest shut itself down
    GuestDidStop,
    /// The network attachment was lost, the machine keeps running
    NetworkDisconnected(String),
}

/// Sending half of the event channel of a machine
pub type MachineEvents = UnboundedSender<MachineEvent>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Configuration rejected, reason: {0}")]
    Invalid(String),
    #[error("Could not instantiate machine, reason: {0}")]
    Instantiate(String),
    #[error("Could not start machine, reason: {0}")]
    Start(String),
    #[error("Could not stop machine, reason: {0}")]
    Stop(String),
}

/// Interface to the hypervisor running the machines
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Running (or about to run) machine owned by the engine
    type Machine: Send + Sync + 'static;

    /// Bounds applied to the CPU count and memory size of every machine
    fn limits(&self) -> PlatformLimits;

    /// Check that the configuration can be instantiated
    fn validate(&self, config: &DeviceConfiguration) -> Result<(), EngineError>;

    /// Create a machine from a validated configuration, callbacks about it are
    /// sent on `events`
    fn instantiate(
        &self,
        config: DeviceConfiguration,
        events: MachineEvents,
    ) -> Result<Self::Machine, EngineError>;

    /// Boot the machine, resolves once the engine reports the outcome
    async fn start(&self, machine: &Self::Machine) -> Result<(), EngineError>;

    /// Stop the machine, resolves once the engine reports the outcome
    async fn stop(&self, machine: &Self::Machine) -> Result<(), EngineError>;
}
