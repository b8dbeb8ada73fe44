use std::path::PathBuf;

use crate::builder::{assert_not_none, Builder, BuilderError};

/// Bus a storage device is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBus {
    /// Paravirtualized block device, used for the main disk
    Virtio,
    /// USB mass storage, used for install media
    Usb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    /// The identifier of the drive
    pub drive_id: String,
    /// Host level path of the disk image
    pub path: PathBuf,
    pub bus: StorageBus,
    pub is_read_only: bool,
}

#[derive(Debug)]
pub struct DriveBuilder {
    pub drive_id: Option<String>,
    pub path: Option<PathBuf>,
    pub bus: StorageBus,
    pub is_read_only: bool,
}

impl Default for DriveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveBuilder {
    pub fn new() -> DriveBuilder {
        DriveBuilder {
            drive_id: None,
            path: None,
            bus: StorageBus::Virtio,
            is_read_only: false,
        }
    }

    pub fn with_drive_id(mut self, drive_id: String) -> DriveBuilder {
        self.drive_id = Some(drive_id);
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> DriveBuilder {
        self.path = Some(path);
        self
    }

    pub fn on_usb(mut self) -> DriveBuilder {
        self.bus = StorageBus::Usb;
        self
    }

    pub fn as_read_only(mut self) -> DriveBuilder {
        self.is_read_only = true;
        self
    }
}

impl Builder<StorageDevice> for DriveBuilder {
    fn try_build(self) -> Result<StorageDevice, BuilderError> {
        Ok(StorageDevice {
            drive_id: assert_not_none(stringify!(self.drive_id), self.drive_id)?,
            path: assert_not_none(stringify!(self.path), self.path)?,
            bus: self.bus,
            is_read_only: self.is_read_only,
        })
    }
}
