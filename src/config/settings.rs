//! Process-wide settings resolved from flags and environment

use crate::utils::paths::data_home;
use crate::Result;
use std::path::PathBuf;

/// Where bundles live and where QEMU is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_home: PathBuf,
    /// Directory holding `qemu-system-*`. `None` searches `PATH`.
    pub qemu_prefix: Option<PathBuf>,
}

impl Settings {
    /// Explicit values (flags, or their environment variables through clap)
    /// win over the per-user default data directory.
    pub fn resolve(data_home_override: Option<PathBuf>, qemu_prefix: Option<PathBuf>) -> Result<Self> {
        let data_home = match data_home_override {
            Some(dir) => dir,
            None => data_home()?,
        };
        Ok(Settings { data_home, qemu_prefix })
    }
}
