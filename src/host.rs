//! Collaborators shared by every VM instance of a process.
use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::info;

use crate::{
    builder::{options::HubOptions, profile::VmProfileBuilder, Builder, BuilderError},
    bundle::BundleStore,
    catalog::{Catalog, CatalogError},
    engine::Engine,
    profile::{GuestKind, VmProfile},
};

/// Supplies the install media of VMs that still need an install, usually
/// backed by a file picker
#[async_trait]
pub trait InstallMediaSource: Send + Sync {
    /// `None` when the user did not pick anything
    async fn pick(&self, profile: &VmProfile) -> Option<PathBuf>;
}

/// Always answers with the same install media
#[derive(Debug, Clone, Default)]
pub struct StaticInstallMedia {
    path: Option<PathBuf>,
}

impl StaticInstallMedia {
    pub fn new(path: PathBuf) -> Self {
        StaticInstallMedia { path: Some(path) }
    }

    /// Behaves like a picker the user always dismisses
    pub fn none() -> Self {
        StaticInstallMedia { path: None }
    }
}

#[async_trait]
impl InstallMediaSource for StaticInstallMedia {
    async fn pick(&self, _profile: &VmProfile) -> Option<PathBuf> {
        self.path.clone()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CreateProfileError {
    #[error(transparent)]
    Invalid(#[from] BuilderError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Engine, catalog, install media source and options used by instances
pub struct Host<E: Engine> {
    pub engine: Arc<E>,
    pub catalog: Arc<dyn Catalog>,
    pub install_media: Arc<dyn InstallMediaSource>,
    pub store: BundleStore,
    pub options: HubOptions,
}

impl<E: Engine> fmt::Debug for Host<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> Host<E> {
    pub fn new(
        engine: Arc<E>,
        catalog: Arc<dyn Catalog>,
        install_media: Arc<dyn InstallMediaSource>,
        options: HubOptions,
    ) -> Self {
        Host {
            engine,
            catalog,
            install_media,
            store: BundleStore::new(),
            options,
        }
    }

    /// Create a profile whose bundle lives in the configured bundle directory
    /// and add it to the catalog
    pub fn create_profile(
        &self,
        name: String,
        guest_kind: GuestKind,
        cpu_count: u32,
        memory_size: u64,
        disk_size: u64,
    ) -> Result<VmProfile, CreateProfileError> {
        let profile = VmProfileBuilder::new()
            .with_name(name)
            .with_parent_dir(self.options.bundle_dir.clone())
            .with_guest_kind(guest_kind)
            .with_cpu_count(cpu_count)
            .with_memory_size(memory_size)
            .with_disk_size(disk_size)
            .try_build()?;
        self.catalog.insert(profile.clone())?;
        info!(
            "Created profile {} ({}) at {}",
            profile.name(),
            profile.identity(),
            profile.bundle_root().display()
        );
        Ok(profile)
    }
}
