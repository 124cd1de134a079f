//! Path utility functions

use anyhow::{anyhow, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Directory name under the per-user data directory.
pub const APP_DIR: &str = "qvmm";

/// Extension of a VM bundle directory.
pub const BUNDLE_EXTENSION: &str = "qvm";

/// Get the data home: `$XDG_DATA_HOME/qvmm`, else `~/.local/share/qvmm`
pub fn data_home() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg).join(APP_DIR));
    }
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow!("no home directory found"))?
        .join(".local")
        .join("share")
        .join(APP_DIR))
}

/// Resolve path under root directory
pub fn resolve_under_root(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Bundle directory for a VM name
pub fn bundle_path(data_home: &Path, name: &str) -> PathBuf {
    data_home.join(format!("{name}.{BUNDLE_EXTENSION}"))
}

/// Get VM configuration file path
pub fn conf_path(root: &Path) -> PathBuf {
    root.join("vm.json")
}

/// PID file written while a foreground `start` owns the VM
pub fn pid_path(root: &Path) -> PathBuf {
    root.join("vm.pid")
}

/// Whether a directory entry looks like a bundle
pub fn is_bundle(path: &Path) -> bool {
    path.is_dir() && path.extension().and_then(|e| e.to_str()) == Some(BUNDLE_EXTENSION)
}
