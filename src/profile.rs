//! # Durable description of a virtual machine
//!
//! A [VmProfile] is the record the catalog keeps for every VM. Besides the
//! requested hardware sizing, it owns the location of the VM bundle: the
//! directory holding the main disk, the machine identifier and the firmware
//! state. Every path inside the bundle is derived from the bundle root, so a
//! profile can never point at files belonging to another VM.
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Stable identifier of a VM, assigned once when the profile is created
pub type VmId = Uuid;

/// Main disk image inside the bundle
pub const MAIN_DISK_IMAGE_FILE: &str = "Disk.img";
/// Serialized machine identifier inside the bundle
pub const MACHINE_IDENTIFIER_FILE: &str = "MachineIdentifier";
/// EFI variable store, Linux guests only
pub const EFI_VARIABLE_STORE_FILE: &str = "NVRAM";
/// Auxiliary storage, other guests only
pub const AUXILIARY_STORAGE_FILE: &str = "AuxiliaryStorage";
/// Hardware model, other guests only
pub const HARDWARE_MODEL_FILE: &str = "HardwareModel";

const BUNDLE_EXTENSION: &str = "bundle";

/// Kind of operating system installed in the guest, it decides which firmware
/// files the bundle holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestKind {
    /// Booted through EFI with a persisted variable store
    Linux,
    /// Booted by the platform loader with auxiliary storage and a hardware model
    Other,
}

/// Firmware files of a bundle, exactly one variant exists per guest kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareLayout {
    Efi {
        variable_store: PathBuf,
    },
    Auxiliary {
        storage: PathBuf,
        hardware_model: PathBuf,
    },
}

impl FirmwareLayout {
    /// All files making up the firmware state
    pub fn files(&self) -> Vec<&Path> {
        match self {
            FirmwareLayout::Efi { variable_store } => vec![variable_store.as_path()],
            FirmwareLayout::Auxiliary {
                storage,
                hardware_model,
            } => vec![storage.as_path(), hardware_model.as_path()],
        }
    }
}

/// Set of files constituting the durable state of a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    pub root: PathBuf,
    pub main_disk_image: PathBuf,
    pub machine_identifier: PathBuf,
    pub firmware: FirmwareLayout,
}

/// Persisted description of one VM.
///
/// Fields are only reachable through getters: the identity and the bundle
/// location never change once the profile exists, and `needs_install` can
/// only move from `true` to `false` through [VmProfile::mark_installed].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProfile {
    identity: VmId,
    name: String,
    guest_kind: GuestKind,
    cpu_count: u32,
    memory_size: u64,
    disk_size: u64,
    needs_install: bool,
    bundle_root: PathBuf,
}

impl VmProfile {
    /// Create a profile with a fresh identity whose bundle lives in `parent`.
    ///
    /// The profile needs an install when its bundle does not exist yet.
    pub fn new(
        parent: &Path,
        name: String,
        guest_kind: GuestKind,
        cpu_count: u32,
        memory_size: u64,
        disk_size: u64,
    ) -> VmProfile {
        let identity = Uuid::new_v4();
        let bundle_root = Self::bundle_root_for(parent, &name, &identity);
        let needs_install = !bundle_root.exists();
        VmProfile {
            identity,
            name,
            guest_kind,
            cpu_count,
            memory_size,
            disk_size,
            needs_install,
            bundle_root,
        }
    }

    /// `{parent}/{name}_{identity}.bundle`, separators in the name are
    /// replaced so the bundle always stays a direct child of `parent`.
    fn bundle_root_for(parent: &Path, name: &str, identity: &VmId) -> PathBuf {
        let name: String = name
            .chars()
            .map(|c| if std::path::is_separator(c) { '_' } else { c })
            .collect();
        parent.join(format!("{}_{}.{}", name, identity, BUNDLE_EXTENSION))
    }

    pub fn identity(&self) -> VmId {
        self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guest_kind(&self) -> GuestKind {
        self.guest_kind
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// Requested memory in bytes
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Size of the main disk in bytes
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn needs_install(&self) -> bool {
        self.needs_install
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    /// Record that the guest has been installed, there is no way back
    pub fn mark_installed(&mut self) {
        self.needs_install = false;
    }

    pub fn main_disk_image_path(&self) -> PathBuf {
        self.bundle_root.join(MAIN_DISK_IMAGE_FILE)
    }

    pub fn machine_identifier_path(&self) -> PathBuf {
        self.bundle_root.join(MACHINE_IDENTIFIER_FILE)
    }

    pub fn efi_variable_store_path(&self) -> Option<PathBuf> {
        match self.guest_kind {
            GuestKind::Linux => Some(self.bundle_root.join(EFI_VARIABLE_STORE_FILE)),
            GuestKind::Other => None,
        }
    }

    pub fn auxiliary_storage_path(&self) -> Option<PathBuf> {
        match self.guest_kind {
            GuestKind::Linux => None,
            GuestKind::Other => Some(self.bundle_root.join(AUXILIARY_STORAGE_FILE)),
        }
    }

    pub fn hardware_model_path(&self) -> Option<PathBuf> {
        match self.guest_kind {
            GuestKind::Linux => None,
            GuestKind::Other => Some(self.bundle_root.join(HARDWARE_MODEL_FILE)),
        }
    }

    pub fn firmware_layout(&self) -> FirmwareLayout {
        match self.guest_kind {
            GuestKind::Linux => FirmwareLayout::Efi {
                variable_store: self.bundle_root.join(EFI_VARIABLE_STORE_FILE),
            },
            GuestKind::Other => FirmwareLayout::Auxiliary {
                storage: self.bundle_root.join(AUXILIARY_STORAGE_FILE),
                hardware_model: self.bundle_root.join(HARDWARE_MODEL_FILE),
            },
        }
    }

    pub fn layout(&self) -> BundleLayout {
        BundleLayout {
            root: self.bundle_root.clone(),
            main_disk_image: self.main_disk_image_path(),
            machine_identifier: self.machine_identifier_path(),
            firmware: self.firmware_layout(),
        }
    }
}
