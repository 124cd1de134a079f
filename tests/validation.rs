//! Validation and argument compilation agree: a configuration with no
//! violations always compiles.

use qvmm::config::constants::{Architecture, ShareMode, Target, UsbBus};
use qvmm::config::defaults::derive_efi_vars;
use qvmm::config::schema::{DisplayFrontend, Vnc};
use qvmm::{ArgumentCompiler, Configuration};
use std::path::PathBuf;

fn variants(arch: Architecture, target: Target) -> Vec<Configuration> {
    let base = Configuration::with_defaults("grid", arch, target);
    let mut out = Vec::new();
    for frontend in 0..4 {
        for bus in [UsbBus::Disabled, UsbBus::Usb2, UsbBus::Usb3] {
            for share in [ShareMode::None, ShareMode::Webdav, ShareMode::Virtfs] {
                for flags in 0u8..32 {
                    let mut cfg = base.clone();
                    match frontend {
                        0 => {}
                        1 => cfg.displays.iter_mut().for_each(|d| d.frontend = DisplayFrontend::Gtk),
                        2 => cfg
                            .displays
                            .iter_mut()
                            .for_each(|d| d.frontend = DisplayFrontend::Vnc(Vnc::default())),
                        _ => cfg.displays.clear(),
                    }
                    cfg.input.usb_bus_support = bus;
                    cfg.sharing.directory_share_mode = share;
                    cfg.sharing.directory_share_path = Some(PathBuf::from("Shared"));
                    cfg.input.has_usb_sharing = flags & 1 != 0;
                    cfg.sharing.has_clipboard_sharing = flags & 2 != 0;
                    cfg.qemu.has_tpm_device = flags & 4 != 0;
                    cfg.qemu.has_uefi_boot = flags & 8 != 0;
                    if flags & 16 != 0 {
                        cfg.drives.extend(derive_efi_vars(arch));
                    }
                    out.push(cfg);
                }
            }
        }
    }
    out
}

#[test]
fn test_valid_configurations_always_compile() {
    let compiler = ArgumentCompiler::new("/fw", "/vms/grid.qvm");
    let mut accepted = 0;
    for &arch in Architecture::ALL {
        for &target in arch.targets() {
            for cfg in variants(arch, target) {
                if !cfg.violations().is_empty() {
                    continue;
                }
                accepted += 1;
                if let Err(e) = compiler.compile(&cfg) {
                    panic!(
                        "{arch}/{target} validated but failed to compile: {e}\n{}",
                        cfg.to_json().unwrap()
                    );
                }
            }
        }
    }
    assert!(accepted > 0);
}

#[test]
fn test_rejected_gtk_webdav_box_is_not_saved() {
    let home = tempfile::TempDir::new().unwrap();
    let mut store = qvmm::VmStore::open(home.path()).unwrap();
    let mut cfg = Configuration::with_defaults("gtkbox", Architecture::X86_64, Target::Q35);
    cfg.displays[0].frontend = DisplayFrontend::Gtk;
    assert!(store.add(cfg).is_err());
    assert!(store.is_empty());
}
