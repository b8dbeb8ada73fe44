//! Catalog of VM profiles.
//!
//! The catalog is owned by the application, this crate only reads profiles
//! from it and writes back the install flag. [MemoryCatalog] keeps everything
//! in memory, it fits embedding and tests.
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use tracing::debug;

use crate::profile::{VmId, VmProfile};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("No profile with identity {0}")]
    NotFound(VmId),
    #[error("A profile with identity {0} already exists")]
    Duplicate(VmId),
    #[error("Catalog storage failed, reason: {0}")]
    Storage(String),
}

/// Persisted set of VM profiles
pub trait Catalog: Send + Sync {
    fn list(&self) -> Result<Vec<VmProfile>, CatalogError>;

    fn insert(&self, profile: VmProfile) -> Result<(), CatalogError>;

    /// Replace the stored profile having the same identity
    fn update(&self, profile: &VmProfile) -> Result<(), CatalogError>;

    fn delete(&self, identity: &VmId) -> Result<(), CatalogError>;

    fn get(&self, identity: &VmId) -> Result<VmProfile, CatalogError> {
        self.list()?
            .into_iter()
            .find(|profile| profile.identity() == *identity)
            .ok_or(CatalogError::NotFound(*identity))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    profiles: Mutex<BTreeMap<VmId, VmProfile>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn profiles(&self) -> std::sync::MutexGuard<'_, BTreeMap<VmId, VmProfile>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for MemoryCatalog {
    fn list(&self) -> Result<Vec<VmProfile>, CatalogError> {
        Ok(self.profiles().values().cloned().collect())
    }

    fn insert(&self, profile: VmProfile) -> Result<(), CatalogError> {
        let mut profiles = self.profiles();
        if profiles.contains_key(&profile.identity()) {
            return Err(CatalogError::Duplicate(profile.identity()));
        }
        debug!("Insert profile {}", profile.identity());
        profiles.insert(profile.identity(), profile);
        Ok(())
    }

    fn update(&self, profile: &VmProfile) -> Result<(), CatalogError> {
        match self.profiles().get_mut(&profile.identity()) {
            Some(stored) => {
                *stored = profile.clone();
                Ok(())
            }
            None => Err(CatalogError::NotFound(profile.identity())),
        }
    }

    fn delete(&self, identity: &VmId) -> Result<(), CatalogError> {
        self.profiles()
            .remove(identity)
            .map(|_| ())
            .ok_or(CatalogError::NotFound(*identity))
    }

    fn get(&self, identity: &VmId) -> Result<VmProfile, CatalogError> {
        self.profiles()
            .get(identity)
            .cloned()
            .ok_or(CatalogError::NotFound(*identity))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::profile::GuestKind;

    fn profile() -> VmProfile {
        VmProfile::new(
            Path::new("/vms"),
            "vm1".to_string(),
            GuestKind::Linux,
            2,
            1 << 30,
            1 << 30,
        )
    }

    #[test]
    fn insert_then_get() {
        let catalog = MemoryCatalog::new();
        let profile = profile();
        catalog.insert(profile.clone()).unwrap();
        assert_eq!(catalog.get(&profile.identity()).unwrap(), profile);
        assert_eq!(catalog.list().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_identity_rejected() {
        let catalog = MemoryCatalog::new();
        let profile = profile();
        catalog.insert(profile.clone()).unwrap();
        assert_eq!(
            catalog.insert(profile.clone()),
            Err(CatalogError::Duplicate(profile.identity()))
        );
    }

    #[test]
    fn update_replaces_stored_profile() {
        let catalog = MemoryCatalog::new();
        let mut profile = profile();
        catalog.insert(profile.clone()).unwrap();
        profile.mark_installed();
        catalog.update(&profile).unwrap();
        assert!(!catalog.get(&profile.identity()).unwrap().needs_install());
    }

    #[test]
    fn unknown_identity() {
        let catalog = MemoryCatalog::new();
        let profile = profile();
        assert_eq!(
            catalog.update(&profile),
            Err(CatalogError::NotFound(profile.identity()))
        );
        assert_eq!(
            catalog.delete(&profile.identity()),
            Err(CatalogError::NotFound(profile.identity()))
        );
    }
}
