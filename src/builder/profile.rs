use std::path::PathBuf;

use crate::builder::{assert_not_none, Builder, BuilderError};
use crate::profile::{GuestKind, VmProfile};

const GIB: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_CPU_COUNT: u32 = 2;
pub const DEFAULT_MEMORY_SIZE: u64 = 4 * GIB;
pub const DEFAULT_DISK_SIZE: u64 = 20 * GIB;

/// Intake of the new VM form, sizes are in bytes
#[derive(Debug)]
pub struct VmProfileBuilder {
    pub name: Option<String>,
    pub parent_dir: Option<PathBuf>,
    pub guest_kind: GuestKind,
    pub cpu_count: u32,
    pub memory_size: u64,
    pub disk_size: u64,
}

impl Default for VmProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmProfileBuilder {
    pub fn new() -> VmProfileBuilder {
        VmProfileBuilder {
            name: None,
            parent_dir: None,
            guest_kind: GuestKind::Linux,
            cpu_count: DEFAULT_CPU_COUNT,
            memory_size: DEFAULT_MEMORY_SIZE,
            disk_size: DEFAULT_DISK_SIZE,
        }
    }

    pub fn with_name(mut self, name: String) -> VmProfileBuilder {
        self.name = Some(name);
        self
    }

    pub fn with_parent_dir(mut self, parent_dir: PathBuf) -> VmProfileBuilder {
        self.parent_dir = Some(parent_dir);
        self
    }

    pub fn with_guest_kind(mut self, guest_kind: GuestKind) -> VmProfileBuilder {
        self.guest_kind = guest_kind;
        self
    }

    pub fn with_cpu_count(mut self, cpu_count: u32) -> VmProfileBuilder {
        self.cpu_count = cpu_count;
        self
    }

    pub fn with_memory_size(mut self, memory_size: u64) -> VmProfileBuilder {
        self.memory_size = memory_size;
        self
    }

    pub fn with_disk_size(mut self, disk_size: u64) -> VmProfileBuilder {
        self.disk_size = disk_size;
        self
    }
}

impl Builder<VmProfile> for VmProfileBuilder {
    fn try_build(self) -> Result<VmProfile, BuilderError> {
        let name = assert_not_none(stringify!(self.name), self.name)?;
        let parent_dir = assert_not_none(stringify!(self.parent_dir), self.parent_dir)?;
        if name.trim().is_empty() {
            return Err(BuilderError::InvalidValue("empty VM name".to_string()));
        }
        if self.disk_size == 0 {
            return Err(BuilderError::InvalidValue("empty main disk".to_string()));
        }
        Ok(VmProfile::new(
            &parent_dir,
            name,
            self.guest_kind,
            self.cpu_count,
            self.memory_size,
            self.disk_size,
        ))
    }
}
