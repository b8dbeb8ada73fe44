use std::{env::var_os, path::PathBuf};

use tracing::warn;

use crate::builder::{devices::DisplayResolution, Builder, BuilderError};

use super::assert_not_none;

/// Environment variable pointing to the directory new bundles are created in
pub const HOME_ENV: &str = "VMPILOT_HOME";

/// When an install run is considered complete, which stops install media from
/// being attached on later launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallPolicy {
    /// As soon as the machine of an install run has started
    #[default]
    FirstBoot,
    /// When the guest of an install run shuts itself down
    GuestShutdown,
}

/// Settings shared by every VM of a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubOptions {
    /// Parent directory of the bundles of newly created profiles
    pub bundle_dir: PathBuf,
    pub display: DisplayResolution,
    pub install_policy: InstallPolicy,
    /// Whether the console agent shares the clipboard with the guest
    pub share_clipboard: bool,
}

#[derive(Debug)]
pub struct HubOptionsBuilder {
    bundle_dir: Option<PathBuf>,
    display: DisplayResolution,
    install_policy: InstallPolicy,
    share_clipboard: bool,
}

impl Default for HubOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HubOptionsBuilder {
    pub fn new() -> HubOptionsBuilder {
        HubOptionsBuilder {
            bundle_dir: None,
            display: DisplayResolution::default(),
            install_policy: InstallPolicy::default(),
            share_clipboard: true,
        }
    }

    /// Tries to determine if variable `VMPILOT_HOME` exists and is a directory
    fn find_bundle_dir_from_env() -> Option<PathBuf> {
        if let Some(path) = var_os(HOME_ENV) {
            if PathBuf::from(&path).is_dir() {
                return Some(PathBuf::from(path));
            }

            warn!("{} is set but is not a directory: {:?}", HOME_ENV, path);
        }
        None
    }

    fn find_bundle_dir_from_home() -> Option<PathBuf> {
        var_os("HOME")
            .map(PathBuf::from)
            .filter(|path| path.is_dir())
    }

    /// Tries to determine where bundles are created (top to bottom priority).
    ///
    /// - `VMPILOT_HOME` environment variable
    /// - `HOME` environment variable
    pub fn determine_bundle_dir() -> Result<PathBuf, BuilderError> {
        Self::find_bundle_dir_from_env()
            .or_else(Self::find_bundle_dir_from_home)
            .ok_or_else(|| {
                BuilderError::BundleDirNotFound(format!(
                    "Set {} to an existing directory",
                    HOME_ENV
                ))
            })
    }

    /// Builder with the bundle directory found by [Self::determine_bundle_dir]
    pub fn auto() -> Result<HubOptionsBuilder, BuilderError> {
        let bundle_dir = Self::determine_bundle_dir()?;
        Ok(Self::new().with_bundle_dir(bundle_dir))
    }

    pub fn with_bundle_dir(mut self, bundle_dir: PathBuf) -> HubOptionsBuilder {
        self.bundle_dir = Some(bundle_dir);
        self
    }

    pub fn with_display(mut self, display: DisplayResolution) -> HubOptionsBuilder {
        self.display = display;
        self
    }

    pub fn with_install_policy(mut self, install_policy: InstallPolicy) -> HubOptionsBuilder {
        self.install_policy = install_policy;
        self
    }

    pub fn sharing_clipboard(mut self, share_clipboard: bool) -> HubOptionsBuilder {
        self.share_clipboard = share_clipboard;
        self
    }
}

impl Builder<HubOptions> for HubOptionsBuilder {
    fn try_build(self) -> Result<HubOptions, BuilderError> {
        if self.display.width == 0 || self.display.height == 0 {
            return Err(BuilderError::InvalidValue(format!(
                "display resolution {}x{}",
                self.display.width, self.display.height
            )));
        }
        Ok(HubOptions {
            bundle_dir: assert_not_none(stringify!(self.bundle_dir), self.bundle_dir)?,
            display: self.display,
            install_policy: self.install_policy,
            share_clipboard: self.share_clipboard,
        })
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use std::path::PathBuf;

    use tempfile::tempdir;

    use crate::builder::devices::DisplayResolution;
    use crate::builder::options::{HubOptionsBuilder, InstallPolicy, HOME_ENV};
    use crate::builder::{Builder, BuilderError};

    #[test]
    fn test_defaults() {
        let options = HubOptionsBuilder::new()
            .with_bundle_dir(PathBuf::from("/vms"))
            .try_build()
            .unwrap();
        assert_eq!(options.display, DisplayResolution::default());
        assert_eq!(options.install_policy, InstallPolicy::FirstBoot);
        assert!(options.share_clipboard);
    }

    #[test]
    fn test_bundle_dir_required() {
        let result = HubOptionsBuilder::new().try_build();
        assert_eq!(
            result.err(),
            Some(BuilderError::MissingRequiredField(
                stringify!(self.bundle_dir).to_string()
            ))
        );
    }

    #[test]
    fn test_empty_display_rejected() {
        let result = HubOptionsBuilder::new()
            .with_bundle_dir(PathBuf::from("/vms"))
            .with_display(DisplayResolution {
                width: 0,
                height: 1200,
            })
            .try_build();
        assert!(matches!(result, Err(BuilderError::InvalidValue(_))));
    }

    #[test]
    #[serial]
    fn test_can_determine_bundle_dir_from_env() {
        let dir = tempdir().expect("failed to create temporary directory");
        std::env::set_var(HOME_ENV, dir.path());
        let result = HubOptionsBuilder::determine_bundle_dir();
        assert_eq!(result.unwrap(), dir.path());
        std::env::remove_var(HOME_ENV);
    }

    #[test]
    #[serial]
    fn test_invalid_env_falls_back_to_home() {
        let home = tempdir().expect("failed to create temporary directory");
        let previous_home = std::env::var_os("HOME");
        std::env::set_var(HOME_ENV, "/tmp/invalid_path/vmpilot");
        std::env::set_var("HOME", home.path());

        let options = HubOptionsBuilder::auto().unwrap().try_build().unwrap();
        assert_eq!(options.bundle_dir, home.path());

        std::env::remove_var(HOME_ENV);
        match previous_home {
            Some(value) => std::env::set_var("HOME", value),
            None => std::env::remove_var("HOME"),
        }
    }

    #[test]
    #[serial]
    fn test_cant_determine_bundle_dir() {
        let previous_home = std::env::var_os("HOME");
        std::env::remove_var(HOME_ENV);
        std::env::set_var("HOME", "/tmp/invalid_path/home");

        let result = HubOptionsBuilder::determine_bundle_dir();
        assert!(matches!(result, Err(BuilderError::BundleDirNotFound(_))));

        match previous_home {
            Some(value) => std::env::set_var("HOME", value),
            None => std::env::remove_var("HOME"),
        }
    }
}
