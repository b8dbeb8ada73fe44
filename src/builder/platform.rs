use std::path::PathBuf;

use crate::builder::{Builder, BuilderError};
use crate::bundle::{FirmwareStore, HardwareModel, MachineIdentifier};

use super::assert_not_none;

/// Hard bounds the host imposes on every VM, profiles cannot override them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformLimits {
    min_cpu_count: u32,
    max_cpu_count: u32,
    min_memory_size: u64,
    max_memory_size: u64,
}

impl PlatformLimits {
    /// Lower bounds greater than their upper bound are lowered to it
    pub fn new(
        min_cpu_count: u32,
        max_cpu_count: u32,
        min_memory_size: u64,
        max_memory_size: u64,
    ) -> PlatformLimits {
        PlatformLimits {
            min_cpu_count: min_cpu_count.min(max_cpu_count),
            max_cpu_count,
            min_memory_size: min_memory_size.min(max_memory_size),
            max_memory_size,
        }
    }

    pub fn min_cpu_count(&self) -> u32 {
        self.min_cpu_count
    }

    pub fn max_cpu_count(&self) -> u32 {
        self.max_cpu_count
    }

    pub fn min_memory_size(&self) -> u64 {
        self.min_memory_size
    }

    pub fn max_memory_size(&self) -> u64 {
        self.max_memory_size
    }

    pub fn clamp_cpu_count(&self, cpu_count: u32) -> u32 {
        cpu_count.max(self.min_cpu_count).min(self.max_cpu_count)
    }

    pub fn clamp_memory_size(&self, memory_size: u64) -> u64 {
        memory_size
            .max(self.min_memory_size)
            .min(self.max_memory_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    /// EFI firmware with its persisted variable store
    Efi { variable_store: PathBuf },
    /// Platform loader backed by auxiliary storage
    Platform { auxiliary_storage: PathBuf },
}

/// Identity of the virtual platform and how it boots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub machine_identifier: MachineIdentifier,
    /// Only set for guests booted by the platform loader
    pub hardware_model: Option<HardwareModel>,
    pub boot_loader: BootLoader,
}

#[derive(Debug)]
pub struct PlatformBuilder {
    pub machine_identifier: Option<MachineIdentifier>,
    pub firmware: Option<FirmwareStore>,
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformBuilder {
    pub fn new() -> PlatformBuilder {
        PlatformBuilder {
            machine_identifier: None,
            firmware: None,
        }
    }

    pub fn with_machine_identifier(
        mut self,
        machine_identifier: MachineIdentifier,
    ) -> PlatformBuilder {
        self.machine_identifier = Some(machine_identifier);
        self
    }

    pub fn with_firmware(mut self, firmware: FirmwareStore) -> PlatformBuilder {
        self.firmware = Some(firmware);
        self
    }
}

impl Builder<Platform> for PlatformBuilder {
    fn try_build(self) -> Result<Platform, BuilderError> {
        let machine_identifier =
            assert_not_none(stringify!(self.machine_identifier), self.machine_identifier)?;
        let (hardware_model, boot_loader) =
            match assert_not_none(stringify!(self.firmware), self.firmware)? {
                FirmwareStore::Efi { variable_store } => {
                    (None, BootLoader::Efi { variable_store })
                }
                FirmwareStore::Auxiliary {
                    storage,
                    hardware_model,
                } => (
                    Some(hardware_model),
                    BootLoader::Platform {
                        auxiliary_storage: storage,
                    },
                ),
            };
        Ok(Platform {
            machine_identifier,
            hardware_model,
            boot_loader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn limits() -> PlatformLimits {
        PlatformLimits::new(1, 16, GIB / 2, 64 * GIB)
    }

    #[test]
    fn cpu_count_is_clamped_silently() {
        let limits = limits();
        assert_eq!(limits.clamp_cpu_count(99), 16);
        assert_eq!(limits.clamp_cpu_count(0), 1);
        assert_eq!(limits.clamp_cpu_count(4), 4);
    }

    #[test]
    fn memory_size_is_clamped_silently() {
        let limits = limits();
        assert_eq!(limits.clamp_memory_size(1), GIB / 2);
        assert_eq!(limits.clamp_memory_size(u64::MAX), 64 * GIB);
        assert_eq!(limits.clamp_memory_size(4 * GIB), 4 * GIB);
    }

    #[test]
    fn clamping_is_idempotent_and_bounded() {
        let limits = limits();
        for cpu in [0, 1, 2, 15, 16, 17, 99, u32::MAX] {
            let once = limits.clamp_cpu_count(cpu);
            assert_eq!(limits.clamp_cpu_count(once), once);
            assert!((limits.min_cpu_count()..=limits.max_cpu_count()).contains(&once));
        }
        for mem in [0, 1, GIB / 2, GIB, 64 * GIB, 65 * GIB, u64::MAX] {
            let once = limits.clamp_memory_size(mem);
            assert_eq!(limits.clamp_memory_size(once), once);
            assert!((limits.min_memory_size()..=limits.max_memory_size()).contains(&once));
        }
    }

    #[test]
    fn clamping_is_monotonic() {
        let limits = limits();
        let mut previous = 0;
        for cpu in 0..40 {
            let clamped = limits.clamp_cpu_count(cpu);
            assert!(clamped >= previous);
            previous = clamped;
        }
    }

    #[test]
    fn inverted_bounds_are_normalized() {
        let limits = PlatformLimits::new(8, 4, 2 * GIB, GIB);
        assert_eq!(limits.min_cpu_count(), 4);
        assert_eq!(limits.min_memory_size(), GIB);
    }

    #[test]
    fn efi_firmware_has_no_hardware_model() {
        let platform = PlatformBuilder::new()
            .with_machine_identifier(MachineIdentifier::generate())
            .with_firmware(FirmwareStore::Efi {
                variable_store: "/vm.bundle/NVRAM".into(),
            })
            .try_build()
            .unwrap();
        assert_eq!(platform.hardware_model, None);
        assert_eq!(
            platform.boot_loader,
            BootLoader::Efi {
                variable_store: "/vm.bundle/NVRAM".into()
            }
        );
    }

    #[test]
    fn auxiliary_firmware_carries_hardware_model() {
        let model = HardwareModel::generate();
        let platform = PlatformBuilder::new()
            .with_machine_identifier(MachineIdentifier::generate())
            .with_firmware(FirmwareStore::Auxiliary {
                storage: "/vm.bundle/AuxiliaryStorage".into(),
                hardware_model: model,
            })
            .try_build()
            .unwrap();
        assert_eq!(platform.hardware_model, Some(model));
    }

    #[test]
    #[should_panic]
    fn partial_platform() {
        PlatformBuilder::new()
            .with_machine_identifier(MachineIdentifier::generate())
            .try_build()
            .unwrap();
    }
}
