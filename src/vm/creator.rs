//! VM creation functionality

use crate::config::constants::{Architecture, ImageType, NetworkMode, ShareMode, Target};
use crate::config::defaults::{derive_drive, derive_efi_vars, DEFAULT_SHARE_DIR, EFI_VARS_FILE};
use crate::config::schema::*;
use crate::utils::paths::resolve_under_root;
use crate::utils::system::{pick_qemu_bin, qemu_img_bin};
use crate::vm::firmware::{firmware_files, locate_vars_template, share_dir_for, share_dir_for_prefix};
use crate::vm::manager::VmManager;
use crate::Result;
use anyhow::{anyhow, bail, Context};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// How the display of a new VM is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DisplayMode {
    Gtk,
    Sdl,
    Vnc,
    Spice,
    Headless,
}

/// VM Creation parameters
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub name: String,
    pub arch: Architecture,
    pub target: Option<Target>,
    pub mem: Option<u32>,
    pub cpus: Option<u16>,
    pub cpu_model: Option<String>,
    pub disk: Option<PathBuf>,
    pub disk_size: Option<String>,
    pub cdrom: Option<PathBuf>,
    pub net_mode: NetworkMode,
    pub bridge_if: Option<String>,
    pub display_mode: DisplayMode,
    pub uefi: bool,
    pub hypervisor: bool,
    pub share: Option<PathBuf>,
}

impl CreateParams {
    /// Parameters that take every default for `arch`.
    pub fn new(name: impl Into<String>, arch: Architecture) -> Self {
        CreateParams {
            name: name.into(),
            arch,
            target: None,
            mem: None,
            cpus: None,
            cpu_model: None,
            disk: None,
            disk_size: None,
            cdrom: None,
            net_mode: NetworkMode::Emulated,
            bridge_if: None,
            display_mode: DisplayMode::Spice,
            uefi: false,
            hypervisor: false,
            share: None,
        }
    }
}

/// VM Creator
pub struct VmCreator;

impl VmCreator {
    /// Derive a configuration for `params` without touching the disk.
    pub fn build_config(params: &CreateParams) -> Result<Configuration> {
        let arch = params.arch;
        let target = params.target.unwrap_or_else(|| arch.default_target());
        if !arch.supports_target(target) {
            bail!(
                "target {target} is not available for {arch} (choose one of: {})",
                arch.targets().iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            );
        }

        let mut cfg = Configuration::with_defaults(params.name.clone(), arch, target);
        if let Some(mem) = params.mem {
            let stored = cfg.system.set_memory_size(mem);
            if stored != mem {
                warn!(requested = mem, stored, "memory size clamped");
            }
        }
        if let Some(cpus) = params.cpus {
            cfg.system.set_cpu_count(cpus);
        }
        if let Some(model) = &params.cpu_model {
            cfg.system.cpu_model = Some(model.clone());
        }

        apply_display_mode(&mut cfg, params.display_mode);

        match params.net_mode {
            NetworkMode::None => cfg.networks.clear(),
            NetworkMode::Bridged => {
                let bridge = params
                    .bridge_if
                    .clone()
                    .ok_or_else(|| anyhow!("--bridge-if is required with --net-mode bridged"))?;
                for net in &mut cfg.networks {
                    net.mode = NetworkMode::Bridged;
                    net.bridge_interface = Some(bridge.clone());
                }
            }
            NetworkMode::Emulated => {}
        }

        // Fixed disk goes first so firmware tries it before the CD.
        let mut disk = derive_drive(arch, target, false);
        disk.image_path = Some(params.disk.clone().unwrap_or_else(|| PathBuf::from("disk.qcow2")));
        cfg.drives.insert(0, disk);

        if let Some(iso) = &params.cdrom {
            match cfg.drives.iter_mut().find(|d| d.is_external && d.image_type == ImageType::Cd) {
                Some(cd) => cd.image_path = Some(iso.clone()),
                None => bail!("{arch} has no removable CD drive to attach {}", iso.display()),
            }
        }

        if let Some(dir) = &params.share {
            if cfg.sharing.directory_share_mode == ShareMode::None {
                cfg.sharing.directory_share_mode = if arch.virtfs_device().is_some() {
                    ShareMode::Virtfs
                } else {
                    bail!("{arch} has no way to share a directory");
                };
            }
            cfg.sharing.directory_share_path = Some(dir.clone());
        }

        if params.uefi {
            if firmware_files(arch).is_none() {
                bail!("{arch} has no UEFI firmware");
            }
            cfg.qemu.has_uefi_boot = true;
            if let Some(vars) = derive_efi_vars(arch) {
                cfg.drives.push(vars);
            }
        }
        cfg.qemu.has_hypervisor = params.hypervisor;

        cfg.validate().map_err(|e| anyhow!(e))?;
        Ok(cfg)
    }

    /// Create a new VM with the given parameters
    pub async fn create_vm(manager: &VmManager, params: CreateParams) -> Result<Configuration> {
        if manager.find(&params.name).is_ok() || manager.bundle_path(&params.name).exists() {
            bail!("VM '{}' already exists", params.name);
        }
        let cfg = Self::build_config(&params)?;

        // Resolve the vars template before anything lands on disk.
        let vars_template = if params.uefi {
            let preferred = firmware_search_dir(manager, cfg.architecture());
            Some(locate_vars_template(cfg.architecture(), preferred.as_deref()).ok_or_else(|| {
                anyhow!("UEFI variable template for {} not found", cfg.architecture())
            })?)
        } else {
            None
        };

        let root = manager.save(cfg.clone())?;
        if let Err(e) = populate_bundle(manager, &root, &cfg, &params, vars_template.as_deref()) {
            // Leave nothing half-created behind.
            let _ = manager.remove(cfg.id()).await;
            return Err(e);
        }

        println!("Created VM '{}' at {}", cfg.name(), root.display());
        Ok(cfg)
    }
}

fn apply_display_mode(cfg: &mut Configuration, mode: DisplayMode) {
    let frontend = match mode {
        DisplayMode::Headless => {
            cfg.displays.clear();
            None
        }
        DisplayMode::Gtk => Some(DisplayFrontend::Gtk),
        DisplayMode::Sdl => Some(DisplayFrontend::Sdl),
        DisplayMode::Vnc => Some(DisplayFrontend::Vnc(Vnc::default())),
        DisplayMode::Spice => Some(DisplayFrontend::Spice(Spice::default())),
    };
    if let Some(frontend) = frontend {
        for display in &mut cfg.displays {
            display.frontend = frontend.clone();
        }
    }

    drop_spice_features(cfg);
}

/// WebDAV sharing, the clipboard and USB redirection ride on SPICE channels.
/// Without a SPICE display they are switched off; returns whether anything
/// changed.
pub fn drop_spice_features(cfg: &mut Configuration) -> bool {
    if cfg.uses_spice() {
        return false;
    }
    let mut changed = false;
    if cfg.sharing.directory_share_mode == ShareMode::Webdav {
        cfg.sharing.directory_share_mode = ShareMode::None;
        cfg.sharing.directory_share_path = None;
        changed = true;
    }
    changed |= std::mem::take(&mut cfg.sharing.has_clipboard_sharing);
    changed |= std::mem::take(&mut cfg.input.has_usb_sharing);
    changed
}

fn firmware_search_dir(manager: &VmManager, arch: Architecture) -> Option<PathBuf> {
    match &manager.settings().qemu_prefix {
        Some(prefix) => Some(share_dir_for_prefix(prefix)),
        None => pick_qemu_bin(None, arch).ok().map(|bin| share_dir_for(&bin)),
    }
}

fn populate_bundle(
    manager: &VmManager,
    root: &Path,
    cfg: &Configuration,
    params: &CreateParams,
    vars_template: Option<&Path>,
) -> Result<()> {
    if let Some(disk) = cfg
        .drives
        .iter()
        .find(|d| !d.is_external && d.image_type == ImageType::Disk)
        .and_then(|d| d.image_path.as_deref())
    {
        let disk_abs = resolve_under_root(root, disk);
        if let Some(sz) = &params.disk_size {
            if !disk_abs.exists() {
                let qemu_img = qemu_img_bin(manager.settings().qemu_prefix.as_deref());
                let status = Command::new(&qemu_img)
                    .args(["create", "-f", "qcow2"])
                    .arg(&disk_abs)
                    .arg(sz)
                    .status()
                    .with_context(|| format!("failed to run {}", qemu_img.display()))?;
                if !status.success() {
                    bail!("qemu-img failed to create disk (size: {sz})");
                }
            }
        } else if !disk_abs.exists() {
            eprintln!(
                "Note: no disk at {} (use --disk-size to create one)",
                disk_abs.display()
            );
        }
    }

    if cfg.sharing.directory_share_path.as_deref() == Some(Path::new(DEFAULT_SHARE_DIR)) {
        let shared = root.join(DEFAULT_SHARE_DIR);
        fs::create_dir_all(&shared).with_context(|| format!("creating {}", shared.display()))?;
    }

    if let Some(template) = vars_template {
        let dest = root.join(EFI_VARS_FILE);
        fs::copy(template, &dest)
            .with_context(|| format!("copying {} to {}", template.display(), dest.display()))?;
        debug!(template = %template.display(), "copied UEFI variable store");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_defaults() {
        let cfg = VmCreator::build_config(&CreateParams::new("dev", Architecture::X86_64)).unwrap();
        assert_eq!(cfg.system.target, Target::Q35);
        assert_eq!(cfg.drives[0].image_path, Some(PathBuf::from("disk.qcow2")));
        assert!(!cfg.drives[0].is_external);
        assert!(cfg.drives[1].is_external);
    }

    #[test]
    fn test_headless_drops_spice_features() {
        let mut params = CreateParams::new("srv", Architecture::X86_64);
        params.display_mode = DisplayMode::Headless;
        let cfg = VmCreator::build_config(&params).unwrap();
        assert!(cfg.displays.is_empty());
        assert_eq!(cfg.sharing.directory_share_mode, ShareMode::None);
        assert!(!cfg.sharing.has_clipboard_sharing);
    }

    #[test]
    fn test_bridged_needs_interface() {
        let mut params = CreateParams::new("br", Architecture::Aarch64);
        params.net_mode = NetworkMode::Bridged;
        assert!(VmCreator::build_config(&params).is_err());
        params.bridge_if = Some("br0".into());
        let cfg = VmCreator::build_config(&params).unwrap();
        assert_eq!(cfg.networks[0].bridge_interface.as_deref(), Some("br0"));
    }

    #[test]
    fn test_overrides_applied() {
        let mut params = CreateParams::new("big", Architecture::Riscv64);
        params.mem = Some(8192);
        params.cpus = Some(8);
        params.cdrom = Some(PathBuf::from("/isos/install.iso"));
        params.uefi = true;
        let cfg = VmCreator::build_config(&params).unwrap();
        assert_eq!(cfg.system.memory_size, 8192);
        assert_eq!(cfg.system.cpu_count, 8);
        assert!(cfg.qemu.has_uefi_boot);
        assert!(cfg.drives.iter().any(|d| d.image_type == ImageType::EfiVars));
        assert!(cfg
            .drives
            .iter()
            .any(|d| d.image_path.as_deref() == Some(Path::new("/isos/install.iso"))));
    }

    #[test]
    fn test_rejects_foreign_target_and_uefi() {
        let mut params = CreateParams::new("x", Architecture::Sparc);
        params.target = Some(Target::Q35);
        assert!(VmCreator::build_config(&params).is_err());

        let mut params = CreateParams::new("y", Architecture::Sparc);
        params.uefi = true;
        assert!(VmCreator::build_config(&params).is_err());
    }
}
