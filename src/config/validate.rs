//! Configuration validation

use crate::config::constants::{DriveInterface, ImageType, NetworkMode, ShareMode, UsbBus};
use crate::config::schema::*;
use crate::error::{ValidationError, Violation};
use crate::vm::firmware;
use std::fmt;
use std::path::Component;

/// A recoverable out-of-range value that validation clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub field: &'static str,
    pub from: u32,
    pub to: u32,
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} adjusted from {} to {}", self.field, self.from, self.to)
    }
}

impl Configuration {
    /// Clamp recoverable values, then report every remaining violation at
    /// once. On success the clamps that were applied are returned.
    pub fn validate(&mut self) -> Result<Vec<Adjustment>, ValidationError> {
        let adjustments = self.normalize();
        let violations = self.violations();
        if violations.is_empty() {
            Ok(adjustments)
        } else {
            Err(ValidationError { violations })
        }
    }

    /// Bring memory, vCPU and USB share counts into range.
    pub fn normalize(&mut self) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();

        let memory = self.system.memory_size;
        if self.system.set_memory_size(memory) != memory {
            adjustments.push(Adjustment {
                field: "memory_size",
                from: memory,
                to: self.system.memory_size,
            });
        }
        let cpus = self.system.cpu_count;
        if self.system.set_cpu_count(cpus) != cpus {
            adjustments.push(Adjustment {
                field: "cpu_count",
                from: cpus.into(),
                to: self.system.cpu_count.into(),
            });
        }
        let share = self.input.maximum_usb_share;
        if self.input.set_maximum_usb_share(share) != share {
            adjustments.push(Adjustment {
                field: "maximum_usb_share",
                from: share.into(),
                to: self.input.maximum_usb_share.into(),
            });
        }
        adjustments
    }

    /// Every invariant this configuration breaks, in field order.
    pub fn violations(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        let arch = self.system.architecture;

        let name = self.information.name.as_str();
        if name.trim().is_empty() {
            out.push(Violation::EmptyName);
        } else if !is_bundle_safe(name) {
            out.push(Violation::InvalidName(name.to_string()));
        }

        if !arch.supports_target(self.system.target) {
            out.push(Violation::TargetMismatch {
                architecture: arch,
                target: self.system.target,
            });
        }

        if self.displays.len() > 1 {
            out.push(Violation::TooManyDisplays(self.displays.len()));
        }
        for display in &self.displays {
            if !arch.display_devices().contains(&display.hardware) {
                out.push(Violation::DisplayDevice {
                    architecture: arch,
                    device: display.hardware,
                });
            }
        }

        for (index, net) in self.networks.iter().enumerate() {
            if !arch.network_devices().contains(&net.hardware) {
                out.push(Violation::NetworkDevice {
                    index,
                    architecture: arch,
                    device: net.hardware,
                });
            }
            let bridge_missing = net.bridge_interface.as_deref().map_or(true, |s| s.trim().is_empty());
            if net.mode == NetworkMode::Bridged && bridge_missing {
                out.push(Violation::MissingBridgeInterface { index });
            }
        }

        let mode = self.sharing.directory_share_mode;
        let path_missing = self
            .sharing
            .directory_share_path
            .as_ref()
            .map_or(true, |p| p.as_os_str().is_empty());
        if mode != ShareMode::None && path_missing {
            out.push(Violation::MissingSharePath(mode));
        }
        if mode == ShareMode::Webdav && !self.uses_spice() {
            out.push(Violation::SpiceRequired {
                feature: "directory sharing via webdav",
            });
        }
        if self.sharing.has_clipboard_sharing && !self.uses_spice() {
            out.push(Violation::SpiceRequired {
                feature: "clipboard sharing",
            });
        }
        if mode == ShareMode::Virtfs && arch.virtfs_device().is_none() {
            out.push(Violation::VirtfsUnsupported { architecture: arch });
        }

        for (index, drive) in self.drives.iter().enumerate() {
            if !arch.drive_interfaces().contains(&drive.interface) {
                out.push(Violation::DriveInterface {
                    index,
                    architecture: arch,
                    interface: drive.interface,
                });
            }
            if !drive.interface.supports(drive.image_type) {
                out.push(Violation::DriveCombination {
                    index,
                    interface: drive.interface,
                    image_type: drive.image_type,
                });
            }
            if drive.image_type == ImageType::EfiVars && firmware::firmware_files(arch).is_none() {
                out.push(Violation::EfiVarsUnsupported { index, architecture: arch });
            }
            if drive.image_type == ImageType::EfiVars && !self.qemu.has_uefi_boot {
                out.push(Violation::EfiVarsWithoutUefi { index });
            }
            if !drive.is_external && drive.image_path.is_none() {
                out.push(Violation::MissingImage { index });
            }
        }

        let input = &self.input;
        if input.usb_bus_support == UsbBus::Disabled {
            if self.drives.iter().any(|d| d.interface == DriveInterface::Usb) {
                out.push(Violation::UsbBusRequired { feature: "USB drives" });
            }
            if input.has_usb_sharing {
                out.push(Violation::UsbBusRequired { feature: "USB sharing" });
            }
        } else {
            if !self.system.target.has_pci_bus() {
                out.push(Violation::UsbControllerUnsupported {
                    target: self.system.target,
                });
            }
            if input.has_usb_sharing && !self.uses_spice() {
                out.push(Violation::SpiceRequired { feature: "USB sharing" });
            }
        }

        let tweaks = &self.qemu;
        if tweaks.has_uefi_boot && firmware::firmware_files(arch).is_none() {
            out.push(Violation::UefiUnsupported { architecture: arch });
        }
        if tweaks.has_tpm_device && arch.tpm_device().is_none() {
            out.push(Violation::TpmUnsupported { architecture: arch });
        }
        out
    }
}

/// A name that maps to exactly one directory entry.
fn is_bundle_safe(name: &str) -> bool {
    let mut components = std::path::Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::*;
    use std::path::PathBuf;

    #[test]
    fn test_clamps_are_reported() {
        let mut cfg = Configuration::with_defaults("vm", Architecture::X86_64, Target::Q35);
        cfg.system.memory_size = 16;
        cfg.system.cpu_count = 400;
        let adjustments = cfg.validate().unwrap();
        assert_eq!(adjustments.len(), 2);
        assert_eq!(adjustments[0].to_string(), "memory_size adjusted from 16 to 32");
        assert_eq!(cfg.system.memory_size, 32);
        assert_eq!(cfg.system.cpu_count, 128);
    }

    #[test]
    fn test_collects_every_violation() {
        let mut cfg = Configuration::with_defaults("", Architecture::Aarch64, Target::Q35);
        cfg.networks[0].mode = NetworkMode::Bridged;
        cfg.sharing.directory_share_mode = ShareMode::Webdav;
        cfg.sharing.directory_share_path = None;
        cfg.drives.push(DriveConfig {
            image_path: None,
            image_type: ImageType::Disk,
            interface: DriveInterface::Ide,
            is_external: false,
            is_read_only: false,
        });

        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                Violation::EmptyName,
                Violation::TargetMismatch {
                    architecture: Architecture::Aarch64,
                    target: Target::Q35
                },
                Violation::MissingBridgeInterface { index: 0 },
                Violation::MissingSharePath(ShareMode::Webdav),
                Violation::DriveInterface {
                    index: 1,
                    architecture: Architecture::Aarch64,
                    interface: DriveInterface::Ide
                },
                Violation::MissingImage { index: 1 },
            ]
        );
    }

    #[test]
    fn test_rejects_path_like_names() {
        for name in ["a/b", "..", ".", "x\\y"] {
            let cfg = Configuration::with_defaults(name, Architecture::X86_64, Target::Q35);
            assert!(
                cfg.violations().contains(&Violation::InvalidName(name.to_string())),
                "{name}"
            );
        }
        let ok = Configuration::with_defaults("Windows 11 (dev)", Architecture::X86_64, Target::Q35);
        assert!(ok.violations().is_empty());
    }

    #[test]
    fn test_efi_vars_need_firmware() {
        let mut cfg = Configuration::with_defaults("mac", Architecture::M68k, Target::Q800);
        cfg.drives.push(DriveConfig {
            image_path: Some(PathBuf::from("efi_vars.fd")),
            image_type: ImageType::EfiVars,
            interface: DriveInterface::Pflash,
            is_external: false,
            is_read_only: false,
        });
        let violations = cfg.violations();
        assert!(violations.contains(&Violation::EfiVarsUnsupported {
            index: 1,
            architecture: Architecture::M68k
        }));
        assert!(violations.contains(&Violation::DriveInterface {
            index: 1,
            architecture: Architecture::M68k,
            interface: DriveInterface::Pflash
        }));
    }

    #[test]
    fn test_spice_features_need_spice() {
        let mut cfg = Configuration::with_defaults("gtkbox", Architecture::X86_64, Target::Q35);
        cfg.displays[0].frontend = DisplayFrontend::Gtk;
        cfg.input.has_usb_sharing = true;
        assert_eq!(
            cfg.violations(),
            vec![
                Violation::SpiceRequired {
                    feature: "directory sharing via webdav"
                },
                Violation::SpiceRequired {
                    feature: "clipboard sharing"
                },
                Violation::SpiceRequired { feature: "USB sharing" },
            ]
        );
    }

    #[test]
    fn test_tweaks_need_backing_devices() {
        let mut cfg = Configuration::with_defaults("sun", Architecture::Sparc, Target::Ss5);
        cfg.qemu.has_tpm_device = true;
        cfg.qemu.has_uefi_boot = true;
        assert_eq!(
            cfg.violations(),
            vec![
                Violation::UefiUnsupported {
                    architecture: Architecture::Sparc
                },
                Violation::TpmUnsupported {
                    architecture: Architecture::Sparc
                },
            ]
        );

        cfg.qemu = QemuTweaks::default();
        cfg.sharing.directory_share_mode = ShareMode::Virtfs;
        cfg.sharing.directory_share_path = Some(PathBuf::from("Shared"));
        assert_eq!(
            cfg.violations(),
            vec![Violation::VirtfsUnsupported {
                architecture: Architecture::Sparc
            }]
        );
    }

    #[test]
    fn test_usb_rules() {
        let mut cfg = Configuration::with_defaults("arm", Architecture::Aarch64, Target::Virt);
        cfg.input.usb_bus_support = UsbBus::Disabled;
        cfg.input.has_usb_sharing = true;
        assert_eq!(
            cfg.violations(),
            vec![
                Violation::UsbBusRequired { feature: "USB drives" },
                Violation::UsbBusRequired { feature: "USB sharing" },
            ]
        );

        let mut dos = Configuration::with_defaults("dos", Architecture::I386, Target::Isapc);
        assert!(dos.violations().is_empty());
        dos.input.usb_bus_support = UsbBus::Usb2;
        assert_eq!(
            dos.violations(),
            vec![Violation::UsbControllerUnsupported { target: Target::Isapc }]
        );
    }

    #[test]
    fn test_efi_vars_need_uefi_boot() {
        let mut cfg = Configuration::with_defaults("efi", Architecture::X86_64, Target::Q35);
        cfg.drives.push(crate::config::defaults::derive_efi_vars(Architecture::X86_64).unwrap());
        assert_eq!(cfg.violations(), vec![Violation::EfiVarsWithoutUefi { index: 1 }]);
        cfg.qemu.has_uefi_boot = true;
        assert!(cfg.violations().is_empty());
    }

    #[test]
    fn test_display_must_match_architecture() {
        let mut cfg = Configuration::with_defaults("sun", Architecture::Sparc, Target::Ss5);
        cfg.displays[0].hardware = DisplayDevice::VirtioVga;
        cfg.displays.push(DisplayConfig::new(DisplayDevice::Cg3));
        let violations = cfg.violations();
        assert_eq!(
            violations,
            vec![
                Violation::TooManyDisplays(2),
                Violation::DisplayDevice {
                    architecture: Architecture::Sparc,
                    device: DisplayDevice::VirtioVga
                },
            ]
        );
    }
}
