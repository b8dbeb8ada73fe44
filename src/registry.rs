//! # Set of live VM instances
//!
//! The [InstanceRegistry] keeps at most one live [InstanceController] per VM
//! identity. Opening a VM which already runs hands back the existing
//! controller, opening it again once its instance has stopped or failed
//! creates a fresh one.
//!
//! Every controller created here removes itself from the registry when it
//! reaches a terminal state, and only then. An instance which is still
//! stopping keeps its entry, so opening its VM hands it back instead of
//! starting a second instance on the same bundle. The removal compares
//! controller instance ids and never evicts a newer instance.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    bundle::BundleError,
    catalog::CatalogError,
    engine::Engine,
    host::Host,
    instance::{InstanceController, InstanceError, InstanceState},
    profile::{VmId, VmProfile},
};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("No VM with identity {0}")]
    NotFound(VmId),
    #[error("Catalog operation failed, reason: {0}")]
    Catalog(CatalogError),
    #[error("Could not remove the VM bundle, reason: {0}")]
    Bundle(#[from] BundleError),
    #[error("Background work was interrupted, reason: {0}")]
    Interrupted(String),
}

impl From<CatalogError> for RegistryError {
    fn from(e: CatalogError) -> RegistryError {
        match e {
            CatalogError::NotFound(identity) => RegistryError::NotFound(identity),
            e => RegistryError::Catalog(e),
        }
    }
}

type Instances<E> = Mutex<HashMap<VmId, InstanceController<E>>>;

pub struct InstanceRegistry<E: Engine> {
    host: Arc<Host<E>>,
    instances: Arc<Instances<E>>,
}

impl<E: Engine> Clone for InstanceRegistry<E> {
    fn clone(&self) -> Self {
        InstanceRegistry {
            host: self.host.clone(),
            instances: self.instances.clone(),
        }
    }
}

impl<E: Engine> fmt::Debug for InstanceRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("host", &self.host)
            .field("instances", &self.identities())
            .finish()
    }
}

fn lock<E: Engine>(
    instances: &Instances<E>,
) -> MutexGuard<'_, HashMap<VmId, InstanceController<E>>> {
    instances.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the entry of `identity` if it still holds the instance `instance_id`
fn evict<E: Engine>(instances: &Instances<E>, identity: VmId, instance_id: Uuid) {
    let mut instances = lock(instances);
    let current = instances.get(&identity).map(InstanceController::instance_id);
    if current == Some(instance_id) {
        instances.remove(&identity);
        debug!("Evicted instance {} of VM {}", instance_id, identity);
    }
}

impl<E: Engine> InstanceRegistry<E> {
    pub fn new(host: Arc<Host<E>>) -> Self {
        InstanceRegistry {
            host,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn host(&self) -> &Arc<Host<E>> {
        &self.host
    }

    /// Return the live controller of the VM, or create and launch one.
    ///
    /// A live controller is returned as is, its configuration is not
    /// rebuilt. Must be called from a tokio runtime.
    #[instrument(skip_all, fields(id = %profile.identity()))]
    pub fn open(&self, profile: VmProfile) -> Result<InstanceController<E>, InstanceError> {
        let identity = profile.identity();
        let mut instances = lock(&self.instances);
        if let Some(existing) = instances.get(&identity) {
            if !existing.state().is_terminal() {
                debug!("VM is already open");
                return Ok(existing.clone());
            }
        }

        let controller = InstanceController::new(profile, self.host.clone());
        let instance_id = controller.instance_id();
        let registry = Arc::downgrade(&self.instances);
        controller.on_terminal(Box::new(move || {
            if let Some(instances) = registry.upgrade() {
                evict(&instances, identity, instance_id);
            }
        }));
        // The hook can only run from the driver task, it waits for the lock
        // until the new entry is in place.
        controller.launch()?;
        instances.insert(identity, controller.clone());
        info!("Opened instance {}", instance_id);
        Ok(controller)
    }

    /// Live controller of the VM, if any
    pub fn get(&self, identity: &VmId) -> Option<InstanceController<E>> {
        lock(&self.instances)
            .get(identity)
            .filter(|controller| !controller.state().is_terminal())
            .cloned()
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        lock(&self.instances)
            .values()
            .filter(|controller| !controller.state().is_terminal())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn identities(&self) -> Vec<VmId> {
        lock(&self.instances)
            .iter()
            .filter(|(_, controller)| !controller.state().is_terminal())
            .map(|(identity, _)| *identity)
            .collect()
    }

    /// Ask the instance of the VM to stop, it leaves the registry once
    /// stopped.
    ///
    /// Returns whether a live instance was registered.
    #[instrument(skip(self))]
    pub fn close(&self, identity: &VmId) -> bool {
        match self.get(identity) {
            Some(controller) => {
                info!("Closing instance {}", controller.instance_id());
                controller.stop();
                true
            }
            None => false,
        }
    }

    /// Stop the VM if it runs, then remove it from the catalog and remove
    /// its bundle from disk
    #[instrument(skip(self))]
    pub async fn delete(&self, identity: &VmId) -> Result<(), RegistryError> {
        let profile = self.host.catalog.get(identity)?;

        if let Some(controller) = self.get(identity) {
            controller.stop();
            let state = controller.wait_terminal().await;
            debug!("Instance {} is {}", controller.instance_id(), state);
        }

        self.host.catalog.delete(identity)?;
        let store = self.host.store.clone();
        tokio::task::spawn_blocking(move || store.remove_bundle(&profile))
            .await
            .map_err(|e| RegistryError::Interrupted(e.to_string()))??;
        info!("Deleted VM");
        Ok(())
    }

    /// Stop every live instance and wait for all of them
    pub async fn shutdown_all(&self) {
        let controllers: Vec<_> = lock(&self.instances)
            .values()
            .filter(|controller| !controller.state().is_terminal())
            .cloned()
            .collect();
        if controllers.is_empty() {
            return;
        }
        info!("Shutting down {} instances", controllers.len());
        for controller in &controllers {
            controller.stop();
        }
        for controller in controllers {
            if controller.wait_terminal().await == InstanceState::Failed {
                warn!(
                    "Instance {} of VM {} failed while shutting down",
                    controller.instance_id(),
                    controller.identity()
                );
            }
        }
    }
}
