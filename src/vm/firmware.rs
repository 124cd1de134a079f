//! Firmware detection

use crate::config::constants::Architecture;
use std::fs;
use std::path::{Path, PathBuf};

/// UEFI code image and the pristine vars template copied into new bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareFiles {
    pub code: &'static str,
    pub vars_template: &'static str,
}

/// EDK2 images QEMU ships for an architecture, if it has UEFI support at all
pub fn firmware_files(arch: Architecture) -> Option<FirmwareFiles> {
    let (code, vars_template) = match arch {
        Architecture::X86_64 => ("edk2-x86_64-code.fd", "edk2-i386-vars.fd"),
        Architecture::I386 => ("edk2-i386-code.fd", "edk2-i386-vars.fd"),
        Architecture::Aarch64 => ("edk2-aarch64-code.fd", "edk2-arm-vars.fd"),
        Architecture::Arm => ("edk2-arm-code.fd", "edk2-arm-vars.fd"),
        Architecture::Riscv64 => ("edk2-riscv-code.fd", "edk2-riscv-vars.fd"),
        _ => return None,
    };
    Some(FirmwareFiles { code, vars_template })
}

/// From qemu-system-* realpath, derive the sibling `share/qemu`
pub fn share_dir_for(qemu_bin: &Path) -> PathBuf {
    let bin_real = qemu_bin
        .canonicalize()
        .unwrap_or_else(|_| qemu_bin.to_path_buf());
    bin_real
        .parent()
        .and_then(|p| p.parent())
        .map(|p| p.join("share").join("qemu"))
        .unwrap_or_else(|| PathBuf::from("/usr/share/qemu"))
}

/// Data directory for a configured prefix (`<prefix>/../share/qemu`)
pub fn share_dir_for_prefix(prefix: &Path) -> PathBuf {
    prefix
        .parent()
        .map(|p| p.join("share").join("qemu"))
        .unwrap_or_else(|| prefix.join("share").join("qemu"))
}

/// Candidate firmware directories: the one next to the binary first, then
/// system and Nix locations.
pub fn search_dirs(preferred: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = preferred.map(Path::to_path_buf).into_iter().collect();
    dirs.extend(
        [
            "/usr/share/qemu",
            "/usr/local/share/qemu",
            "/run/current-system/sw/share/qemu",
            "/nix/var/nix/profiles/system/sw/share/qemu",
        ]
        .iter()
        .map(PathBuf::from),
    );

    // Also scan /nix/store/*-qemu-*/share/qemu
    if let Ok(iter) = fs::read_dir("/nix/store") {
        for e in iter.flatten() {
            let p = e.path();
            let is_qemu = p
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| name.contains("-qemu-"));
            if is_qemu {
                let q = p.join("share/qemu");
                if q.is_dir() {
                    dirs.push(q);
                }
            }
        }
    }
    dirs
}

/// Find the vars template for an architecture in the first directory holding it
pub fn locate_vars_template(arch: Architecture, preferred: Option<&Path>) -> Option<PathBuf> {
    let files = firmware_files(arch)?;
    search_dirs(preferred)
        .into_iter()
        .map(|d| d.join(files.vars_template))
        .find(|p| p.is_file())
}
