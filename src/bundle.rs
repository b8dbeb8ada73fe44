//! # On-disk state of a VM
//!
//! [BundleStore] owns every file operation performed on a VM bundle. Boot
//! state (machine identifier and firmware) has two separate code paths: it is
//! created exactly once, during the install run, and loaded unchanged on
//! every later boot. Regenerating it after the install would detach the
//! installed guest from its firmware, so there is no "create or load"
//! shortcut here.
//!
//! All operations are blocking, callers running on an async runtime should
//! move them to the blocking pool.
use std::{
    fs::{self, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use crate::profile::{FirmwareLayout, GuestKind, VmProfile};

/// Header of an EFI variable store created by [BundleStore]
pub const EFI_VARIABLE_STORE_MAGIC: &[u8; 8] = b"VPNVRAM1";
/// Header of an auxiliary storage created by [BundleStore]
pub const AUXILIARY_STORAGE_MAGIC: &[u8; 8] = b"VPAUXST1";

#[derive(thiserror::Error, Debug)]
pub enum BundleError {
    #[error("Could not create bundle at {0}, reason: {1}")]
    Create(PathBuf, io::Error),
    #[error("Could not allocate disk image at {0}, reason: {1}")]
    DiskAllocation(PathBuf, io::Error),
    #[error("Machine identifier not found at {0}")]
    IdentityNotFound(PathBuf),
    #[error("Machine identifier at {0} is corrupt, reason: {1}")]
    IdentityCorrupt(PathBuf, String),
    #[error("Firmware state not found at {0}")]
    FirmwareNotFound(PathBuf),
    #[error("Firmware state at {0} is corrupt, reason: {1}")]
    FirmwareCorrupt(PathBuf, String),
    #[error("VM is marked as installed but its state is missing: {0:?}")]
    MissingState(Vec<PathBuf>),
    #[error("I/O error on {0}, reason: {1}")]
    Io(PathBuf, io::Error),
    #[error("Could not remove bundle at {0}, reason: {1}")]
    Remove(PathBuf, io::Error),
}

/// Opaque token binding the persisted state of a VM to one machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineIdentifier {
    id: Uuid,
}

impl MachineIdentifier {
    pub fn generate() -> Self {
        MachineIdentifier { id: Uuid::new_v4() }
    }

    pub fn data_representation(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_data_representation(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Hardware model the platform loader of non Linux guests is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareModel {
    model: Uuid,
}

impl HardwareModel {
    pub fn generate() -> Self {
        HardwareModel {
            model: Uuid::new_v4(),
        }
    }
}

/// Handle on the persisted firmware state of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareStore {
    Efi {
        variable_store: PathBuf,
    },
    Auxiliary {
        storage: PathBuf,
        hardware_model: HardwareModel,
    },
}

impl FirmwareStore {
    pub fn guest_kind(&self) -> GuestKind {
        match self {
            FirmwareStore::Efi { .. } => GuestKind::Linux,
            FirmwareStore::Auxiliary { .. } => GuestKind::Other,
        }
    }
}

/// Everything needed to boot a VM besides its disks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootState {
    pub machine_identifier: MachineIdentifier,
    pub firmware: FirmwareStore,
}

/// Creates, loads and removes the files of VM bundles
#[derive(Debug, Clone, Default)]
pub struct BundleStore {}

impl BundleStore {
    pub fn new() -> Self {
        BundleStore {}
    }

    /// Create the bundle directory, its parent must already exist
    #[instrument(skip(self))]
    pub fn ensure_bundle(&self, root: &Path) -> Result<(), BundleError> {
        debug!("Creating bundle at {}", root.display());
        fs::create_dir(root).map_err(|e| BundleError::Create(root.to_path_buf(), e))
    }

    /// Create an empty file of `size` bytes without writing its content
    #[instrument(skip(self))]
    pub fn allocate_disk_image(&self, path: &Path, size: u64) -> Result<(), BundleError> {
        debug!("Allocating {} bytes for {}", size, path.display());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| BundleError::DiskAllocation(path.to_path_buf(), e))?;
        file.set_len(size)
            .map_err(|e| BundleError::DiskAllocation(path.to_path_buf(), e))
    }

    #[instrument(skip(self))]
    pub fn create_identity(&self, path: &Path) -> Result<MachineIdentifier, BundleError> {
        let identifier = MachineIdentifier::generate();
        let data = identifier
            .data_representation()
            .map_err(|e| BundleError::IdentityCorrupt(path.to_path_buf(), e.to_string()))?;
        fs::write(path, data).map_err(|e| BundleError::Io(path.to_path_buf(), e))?;
        trace!("Machine identifier: {:?}", identifier);
        Ok(identifier)
    }

    #[instrument(skip(self))]
    pub fn load_identity(&self, path: &Path) -> Result<MachineIdentifier, BundleError> {
        let data = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BundleError::IdentityNotFound(path.to_path_buf()),
            _ => BundleError::Io(path.to_path_buf(), e),
        })?;
        MachineIdentifier::from_data_representation(&data)
            .map_err(|e| BundleError::IdentityCorrupt(path.to_path_buf(), e.to_string()))
    }

    #[instrument(skip(self))]
    pub fn create_firmware_store(
        &self,
        layout: &FirmwareLayout,
    ) -> Result<FirmwareStore, BundleError> {
        match layout {
            FirmwareLayout::Efi { variable_store } => {
                fs::write(variable_store, EFI_VARIABLE_STORE_MAGIC)
                    .map_err(|e| BundleError::Io(variable_store.clone(), e))?;
                Ok(FirmwareStore::Efi {
                    variable_store: variable_store.clone(),
                })
            }
            FirmwareLayout::Auxiliary {
                storage,
                hardware_model,
            } => {
                fs::write(storage, AUXILIARY_STORAGE_MAGIC)
                    .map_err(|e| BundleError::Io(storage.clone(), e))?;
                let model = HardwareModel::generate();
                let data = serde_json::to_vec(&model).map_err(|e| {
                    BundleError::FirmwareCorrupt(hardware_model.clone(), e.to_string())
                })?;
                fs::write(hardware_model, data)
                    .map_err(|e| BundleError::Io(hardware_model.clone(), e))?;
                Ok(FirmwareStore::Auxiliary {
                    storage: storage.clone(),
                    hardware_model: model,
                })
            }
        }
    }

    #[instrument(skip(self))]
    pub fn load_firmware_store(
        &self,
        layout: &FirmwareLayout,
    ) -> Result<FirmwareStore, BundleError> {
        match layout {
            FirmwareLayout::Efi { variable_store } => {
                Self::check_magic(variable_store, EFI_VARIABLE_STORE_MAGIC)?;
                Ok(FirmwareStore::Efi {
                    variable_store: variable_store.clone(),
                })
            }
            FirmwareLayout::Auxiliary {
                storage,
                hardware_model,
            } => {
                Self::check_magic(storage, AUXILIARY_STORAGE_MAGIC)?;
                let data = fs::read(hardware_model).map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => {
                        BundleError::FirmwareNotFound(hardware_model.clone())
                    }
                    _ => BundleError::Io(hardware_model.clone(), e),
                })?;
                let model = serde_json::from_slice(&data).map_err(|e| {
                    BundleError::FirmwareCorrupt(hardware_model.clone(), e.to_string())
                })?;
                Ok(FirmwareStore::Auxiliary {
                    storage: storage.clone(),
                    hardware_model: model,
                })
            }
        }
    }

    fn check_magic(path: &Path, magic: &[u8; 8]) -> Result<(), BundleError> {
        let mut file = fs::File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BundleError::FirmwareNotFound(path.to_path_buf()),
            _ => BundleError::Io(path.to_path_buf(), e),
        })?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header).map_err(|e| {
            BundleError::FirmwareCorrupt(path.to_path_buf(), e.to_string())
        })?;
        if &header != magic {
            return Err(BundleError::FirmwareCorrupt(
                path.to_path_buf(),
                "unexpected header".to_string(),
            ));
        }
        Ok(())
    }

    /// Make sure the bundle directory and the main disk exist.
    ///
    /// The bundle is only created when missing, the disk is (re)allocated when
    /// it is missing or shorter than the requested size, which happens when a
    /// previous install run failed half-way.
    #[instrument(skip_all, fields(id = %profile.identity()))]
    pub fn provision(&self, profile: &VmProfile) -> Result<(), BundleError> {
        let root = profile.bundle_root();
        if !root.is_dir() {
            info!("Creating bundle {}", root.display());
            self.ensure_bundle(root)?;
        }

        let disk = profile.main_disk_image_path();
        let allocated = fs::metadata(&disk).map(|m| m.len()).unwrap_or(0);
        if !disk.exists() || allocated < profile.disk_size() {
            info!("Allocating main disk image");
            self.allocate_disk_image(&disk, profile.disk_size())?;
        }
        Ok(())
    }

    /// Generate the boot state of a VM being installed
    #[instrument(skip_all, fields(id = %profile.identity()))]
    pub fn create_boot_state(&self, profile: &VmProfile) -> Result<BootState, BundleError> {
        info!("Creating machine identifier and firmware state");
        let machine_identifier = self.create_identity(&profile.machine_identifier_path())?;
        let firmware = self.create_firmware_store(&profile.firmware_layout())?;
        Ok(BootState {
            machine_identifier,
            firmware,
        })
    }

    /// Load the boot state saved during the install run
    #[instrument(skip_all, fields(id = %profile.identity()))]
    pub fn load_boot_state(&self, profile: &VmProfile) -> Result<BootState, BundleError> {
        let layout = profile.layout();
        let missing: Vec<PathBuf> = [
            layout.main_disk_image.as_path(),
            layout.machine_identifier.as_path(),
        ]
        .into_iter()
        .chain(layout.firmware.files())
        .filter(|p| !p.exists())
        .map(Path::to_path_buf)
        .collect();
        if !missing.is_empty() {
            return Err(BundleError::MissingState(missing));
        }

        info!("Loading machine identifier and firmware state");
        let machine_identifier = self.load_identity(&layout.machine_identifier)?;
        let firmware = self.load_firmware_store(&layout.firmware)?;
        Ok(BootState {
            machine_identifier,
            firmware,
        })
    }

    /// Recursively delete the bundle of a profile, a missing bundle is not an error
    #[instrument(skip_all, fields(id = %profile.identity()))]
    pub fn remove_bundle(&self, profile: &VmProfile) -> Result<(), BundleError> {
        let root = profile.bundle_root();
        match fs::remove_dir_all(root) {
            Ok(()) => {
                info!("Removed bundle {}", root.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BundleError::Remove(root.to_path_buf(), e)),
        }
    }
}
