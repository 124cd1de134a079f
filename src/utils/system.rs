//! System utility functions

use crate::config::constants::Architecture;
use crate::error::SupervisorError;
use crate::utils::paths::pid_path;
use std::fs;
use std::path::{Path, PathBuf};

/// Fallback install locations searched after `PATH`
const SYSTEM_BIN_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin", "/run/current-system/sw/bin"];

/// Locally administered MAC in QEMU's `52:54:00` range
pub fn random_mac() -> String {
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>()
    )
}

/// Pick the `qemu-system-*` executable for an architecture.
///
/// With a prefix only `<prefix>/qemu-system-<arch>` is accepted; without one
/// `PATH` is searched first, then the usual system and Nix locations.
pub fn pick_qemu_bin(prefix: Option<&Path>, arch: Architecture) -> Result<PathBuf, SupervisorError> {
    let binary = arch.qemu_binary();
    let candidates: Vec<PathBuf> = match prefix {
        Some(dir) => vec![dir.join(&binary)],
        None => which::which(&binary)
            .ok()
            .into_iter()
            .chain(SYSTEM_BIN_DIRS.iter().map(|d| Path::new(d).join(&binary)))
            .collect(),
    };

    match candidates.iter().find(|p| p.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(SupervisorError::ExecutableNotFound { binary, searched: candidates }),
    }
}

/// Companion `qemu-img` next to the configured prefix, or from `PATH`
pub fn qemu_img_bin(prefix: Option<&Path>) -> PathBuf {
    match prefix {
        Some(dir) => dir.join("qemu-img"),
        None => which::which("qemu-img").unwrap_or_else(|_| PathBuf::from("qemu-img")),
    }
}

/// Whether a process with this PID exists
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence and permission.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// PID recorded in a bundle's pid file, if that process is still alive.
/// A stale pid file is removed.
pub fn running_pid(bundle: &Path) -> Option<u32> {
    let pid_file = pid_path(bundle);
    let text = fs::read_to_string(&pid_file).ok()?;
    match text.trim().parse::<u32>() {
        Ok(pid) if pid_alive(pid) => Some(pid),
        _ => {
            let _ = fs::remove_file(&pid_file);
            None
        }
    }
}

/// Ask a process to shut down gracefully (SIGTERM)
pub fn terminate_pid(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain kill(2); the pid came from our own pid file.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ))
    }
}
