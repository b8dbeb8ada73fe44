//! # Device configuration builder pattern
//!
//! This module assembles the device configuration a VM boots with. Each
//! component has its own builder whose fields are validated once you run the
//! [`Builder::try_build`] method. [DeviceConfigBuilder] puts them together
//! from a [VmProfile] and the [BootState] loaded from its bundle; it performs
//! no I/O, so the same inputs always produce the same configuration.
//!
//! ## Example
//!
//! ```rust
//! use vmpilot::builder::{Builder, DeviceConfigBuilder};
//! use vmpilot::builder::platform::PlatformLimits;
//! use vmpilot::builder::profile::VmProfileBuilder;
//! use vmpilot::bundle::{BootState, FirmwareStore, MachineIdentifier};
//!
//! let mut profile = VmProfileBuilder::new()
//!     .with_name("debian".to_string())
//!     .with_parent_dir("/tmp/vms".into())
//!     .with_cpu_count(99)
//!     .try_build()
//!     .unwrap();
//! profile.mark_installed();
//!
//! let boot_state = BootState {
//!     machine_identifier: MachineIdentifier::generate(),
//!     firmware: FirmwareStore::Efi {
//!         variable_store: profile.efi_variable_store_path().unwrap(),
//!     },
//! };
//! let limits = PlatformLimits::new(1, 16, 512 << 20, 64 << 30);
//! let config = DeviceConfigBuilder::new(limits)
//!     .with_profile(profile)
//!     .with_boot_state(boot_state)
//!     .try_build()
//!     .unwrap();
//! assert_eq!(config.cpu_count, 16);
//! assert_eq!(config.storage.len(), 1);
//! ```
use std::path::PathBuf;

use crate::bundle::BootState;
use crate::profile::VmProfile;

use console::{ConsoleDevice, ConsolePortBuilder};
use devices::{AudioDevice, DisplayResolution, GraphicsDevice, Keyboard, PointingDevice};
use drive::{DriveBuilder, StorageDevice};
use network::{NetworkDevice, NetworkDeviceBuilder};
use options::HubOptions;
use platform::{Platform, PlatformBuilder, PlatformLimits};

pub mod console;
pub mod devices;
pub mod drive;
pub mod network;
pub mod options;
pub mod platform;
pub mod profile;

/// Drive identifier of the install media
pub const INSTALL_MEDIA_DRIVE_ID: &str = "installer";
/// Drive identifier of the main disk
pub const MAIN_DISK_DRIVE_ID: &str = "main";
/// Interface identifier of the NAT network device
pub const NETWORK_IFACE_ID: &str = "net0";

fn assert_not_none<T>(key: &str, value: Option<T>) -> Result<T, BuilderError> {
    match value {
        Some(value) => Ok(value),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),
    /// The field was provided but cannot be used
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// Happens when using auto methods to detect the bundle directory
    #[error("Bundle directory not found: {0}")]
    BundleDirNotFound(String),
}

/// Generic trait which all builder components must implement
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply it to the
    /// final object
    ///
    /// ## Example
    ///
    /// ```rust
    /// use vmpilot::builder::Builder;
    /// use vmpilot::builder::network::NetworkDeviceBuilder;
    ///
    /// NetworkDeviceBuilder::new()
    ///     .with_iface_id("net0".to_string())
    ///     .with_nat()
    ///     .try_build()
    ///     .unwrap();
    /// ```
    fn try_build(self) -> Result<T, BuilderError>;
}

/// Complete set of devices a VM boots with, rebuilt on every start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfiguration {
    pub cpu_count: u32,
    /// Memory in bytes
    pub memory_size: u64,
    pub platform: Platform,
    pub storage: Vec<StorageDevice>,
    pub network: Vec<NetworkDevice>,
    pub graphics: Vec<GraphicsDevice>,
    pub audio: Vec<AudioDevice>,
    pub keyboards: Vec<Keyboard>,
    pub pointing_devices: Vec<PointingDevice>,
    pub consoles: Vec<ConsoleDevice>,
}

/// Turns a profile and its boot state into a [DeviceConfiguration]
#[derive(Debug)]
pub struct DeviceConfigBuilder {
    limits: PlatformLimits,
    display: DisplayResolution,
    share_clipboard: bool,
    profile: Option<VmProfile>,
    boot_state: Option<BootState>,
    install_media: Option<PathBuf>,
}

impl DeviceConfigBuilder {
    pub fn new(limits: PlatformLimits) -> DeviceConfigBuilder {
        DeviceConfigBuilder {
            limits,
            display: DisplayResolution::default(),
            share_clipboard: true,
            profile: None,
            boot_state: None,
            install_media: None,
        }
    }

    /// Apply the host wide device policy
    pub fn with_options(mut self, options: &HubOptions) -> DeviceConfigBuilder {
        self.display = options.display;
        self.share_clipboard = options.share_clipboard;
        self
    }

    pub fn with_profile(mut self, profile: VmProfile) -> DeviceConfigBuilder {
        self.profile = Some(profile);
        self
    }

    pub fn with_boot_state(mut self, boot_state: BootState) -> DeviceConfigBuilder {
        self.boot_state = Some(boot_state);
        self
    }

    /// Only attached when the profile still needs an install
    pub fn with_install_media(mut self, install_media: PathBuf) -> DeviceConfigBuilder {
        self.install_media = Some(install_media);
        self
    }

    fn storage(
        profile: &VmProfile,
        install_media: Option<PathBuf>,
    ) -> Result<Vec<StorageDevice>, BuilderError> {
        let mut storage = Vec::with_capacity(2);
        if profile.needs_install() {
            let install_media = assert_not_none(stringify!(self.install_media), install_media)?;
            storage.push(
                DriveBuilder::new()
                    .with_drive_id(INSTALL_MEDIA_DRIVE_ID.to_string())
                    .with_path(install_media)
                    .on_usb()
                    .as_read_only()
                    .try_build()?,
            );
        }
        storage.push(
            DriveBuilder::new()
                .with_drive_id(MAIN_DISK_DRIVE_ID.to_string())
                .with_path(profile.main_disk_image_path())
                .try_build()?,
        );
        Ok(storage)
    }
}

impl Builder<DeviceConfiguration> for DeviceConfigBuilder {
    fn try_build(self) -> Result<DeviceConfiguration, BuilderError> {
        let profile = assert_not_none(stringify!(self.profile), self.profile)?;
        let boot_state = assert_not_none(stringify!(self.boot_state), self.boot_state)?;
        if boot_state.firmware.guest_kind() != profile.guest_kind() {
            return Err(BuilderError::InvalidValue(format!(
                "firmware for {:?} guest given to a {:?} guest",
                boot_state.firmware.guest_kind(),
                profile.guest_kind()
            )));
        }

        let platform = PlatformBuilder::new()
            .with_machine_identifier(boot_state.machine_identifier)
            .with_firmware(boot_state.firmware)
            .try_build()?;
        let storage = Self::storage(&profile, self.install_media)?;
        let network = NetworkDeviceBuilder::new()
            .with_iface_id(NETWORK_IFACE_ID.to_string())
            .with_nat()
            .try_build()?;
        let clipboard_port = ConsolePortBuilder::clipboard_agent()
            .sharing_clipboard(self.share_clipboard)
            .try_build()?;

        Ok(DeviceConfiguration {
            cpu_count: self.limits.clamp_cpu_count(profile.cpu_count()),
            memory_size: self.limits.clamp_memory_size(profile.memory_size()),
            platform,
            storage,
            network: vec![network],
            graphics: vec![GraphicsDevice::single_display(self.display)],
            audio: vec![AudioDevice::input(), AudioDevice::output()],
            keyboards: vec![Keyboard::Usb],
            pointing_devices: vec![PointingDevice::UsbScreenCoordinate],
            consoles: vec![ConsoleDevice {
                ports: vec![clipboard_port],
            }],
        })
    }
}
