//! Defaults derived from architecture and machine profile
//!
//! The profile tables are evaluated top to bottom; the first matching
//! profile decides. Afterwards architectures without a guest agent lose
//! dynamic resolution and clipboard sharing no matter what the table chose.

use crate::config::constants::*;
use crate::config::schema::*;
use crate::vm::firmware;
use std::path::PathBuf;

/// Share directory used when a profile enables directory sharing. Relative,
/// so it lives inside the bundle.
pub const DEFAULT_SHARE_DIR: &str = "Shared";

/// EFI variable store file inside the bundle.
pub const EFI_VARS_FILE: &str = "efi_vars.fd";

/// Machine profiles with dedicated defaults, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Profile {
    /// i440FX PC.
    LegacyPc,
    /// ICH9 PC.
    Q35,
    /// ISA-only PC.
    IsaPc,
    /// arm/aarch64 `virt`.
    ArmVirt,
    /// m68k Quadra 800.
    Quadra,
    /// PowerMac `mac99`.
    PowerMac,
    Other,
}

fn classify(architecture: Architecture, target: Target) -> Profile {
    use Architecture::*;
    match (architecture, target) {
        (I386 | X86_64, Target::Pc) => Profile::LegacyPc,
        (I386 | X86_64, Target::Q35) => Profile::Q35,
        (I386 | X86_64, Target::Isapc) => Profile::IsaPc,
        (Arm | Aarch64, Target::Virt) => Profile::ArmVirt,
        (M68k, Target::Q800) => Profile::Quadra,
        (Ppc | Ppc64, Target::Mac99) => Profile::PowerMac,
        _ => Profile::Other,
    }
}

/// Display for a new VM, or `None` when the architecture has no card at all.
pub fn derive_display(architecture: Architecture, target: Target) -> Option<DisplayConfig> {
    let (hardware, dynamic) = match classify(architecture, target) {
        Profile::LegacyPc => (DisplayDevice::CirrusVga, false),
        Profile::Q35 => (DisplayDevice::VirtioVga, true),
        Profile::IsaPc => (DisplayDevice::IsaVga, false),
        Profile::ArmVirt => (DisplayDevice::VirtioRamfb, true),
        Profile::Quadra => (DisplayDevice::NubusMacfb, true),
        Profile::PowerMac | Profile::Other => (fallback_display(architecture)?, true),
    };
    let mut display = DisplayConfig::new(hardware);
    display.is_dynamic_resolution = dynamic && architecture.has_agent_support();
    Some(display)
}

fn fallback_display(architecture: Architecture) -> Option<DisplayDevice> {
    let cards = architecture.display_devices();
    if cards.contains(&DisplayDevice::Vga) {
        Some(DisplayDevice::Vga)
    } else {
        cards.first().copied()
    }
}

/// Network card for a new VM, or `None` when the architecture has none.
pub fn derive_network(architecture: Architecture, target: Target) -> Option<NetworkConfig> {
    let hardware = match classify(architecture, target) {
        Profile::LegacyPc => NetworkDevice::Rtl8139,
        Profile::Q35 => NetworkDevice::E1000,
        Profile::IsaPc => NetworkDevice::Ne2kIsa,
        Profile::ArmVirt => NetworkDevice::VirtioNetPci,
        Profile::Quadra => NetworkDevice::Dp8393x,
        Profile::PowerMac => NetworkDevice::Sungem,
        Profile::Other => {
            let cards = architecture.network_devices();
            if cards.contains(&NetworkDevice::Rtl8139) {
                NetworkDevice::Rtl8139
            } else {
                *cards.first()?
            }
        }
    };
    Some(NetworkConfig::new(hardware))
}

/// Drive for a new VM. External drives are CD-ROMs, internal ones disks.
/// The interface is always one the architecture accepts for that image kind.
pub fn derive_drive(architecture: Architecture, target: Target, is_external: bool) -> DriveConfig {
    let image_type = if is_external { ImageType::Cd } else { ImageType::Disk };
    let preferred = match (classify(architecture, target), image_type) {
        (Profile::ArmVirt, ImageType::Cd) => Some(DriveInterface::Usb),
        (Profile::ArmVirt, _) => Some(DriveInterface::Virtio),
        (Profile::Q35, ImageType::Cd) => Some(DriveInterface::Ide),
        (Profile::Q35, _) => Some(DriveInterface::Virtio),
        (Profile::LegacyPc | Profile::IsaPc | Profile::PowerMac, _) => Some(DriveInterface::Ide),
        (Profile::Quadra, _) => Some(DriveInterface::Scsi),
        (Profile::Other, _) => None,
    };
    let table = architecture.drive_interfaces();
    let interface = preferred
        .filter(|i| table.contains(i) && i.supports(image_type))
        .or_else(|| table.iter().copied().find(|i| i.supports(image_type)))
        // every table carries an interface for disks and CDs
        .unwrap_or(table[0]);
    DriveConfig {
        image_path: None,
        image_type,
        interface,
        is_external,
        is_read_only: image_type == ImageType::Cd,
    }
}

/// UEFI variable store drive, for architectures that ship UEFI firmware.
pub fn derive_efi_vars(architecture: Architecture) -> Option<DriveConfig> {
    firmware::firmware_files(architecture)?;
    Some(DriveConfig {
        image_path: Some(PathBuf::from(EFI_VARS_FILE)),
        image_type: ImageType::EfiVars,
        interface: DriveInterface::Pflash,
        is_external: false,
        is_read_only: false,
    })
}

pub fn derive_sharing(architecture: Architecture, target: Target) -> SharingConfig {
    let mut sharing = SharingConfig::default();
    match classify(architecture, target) {
        Profile::LegacyPc | Profile::Q35 => {
            sharing.directory_share_mode = ShareMode::Webdav;
            sharing.has_clipboard_sharing = true;
        }
        Profile::ArmVirt if architecture.has_agent_support() => {
            sharing.directory_share_mode = ShareMode::Webdav;
            sharing.has_clipboard_sharing = true;
        }
        Profile::Quadra | Profile::PowerMac => {
            sharing.directory_share_mode = ShareMode::Virtfs;
        }
        Profile::ArmVirt | Profile::IsaPc | Profile::Other => {}
    }
    if sharing.directory_share_mode != ShareMode::None {
        sharing.directory_share_path = Some(PathBuf::from(DEFAULT_SHARE_DIR));
    }
    if !architecture.has_agent_support() {
        sharing.has_clipboard_sharing = false;
    }
    sharing
}

/// USB controller for a new VM. Boards without PCI get none.
pub fn derive_input(architecture: Architecture, target: Target) -> InputConfig {
    let usb_bus_support = if target.has_pci_bus() {
        architecture.default_usb_bus()
    } else {
        UsbBus::Disabled
    };
    InputConfig {
        usb_bus_support,
        ..InputConfig::default()
    }
}

impl Configuration {
    /// A configuration with every section derived for `architecture` and
    /// `target`: one display and network card when the architecture has
    /// them, an empty removable CD drive, sharing and USB defaults.
    pub fn with_defaults(name: impl Into<String>, architecture: Architecture, target: Target) -> Self {
        let mut cfg = Configuration::new(name, architecture, target);
        if architecture == Architecture::Aarch64 {
            cfg.system.cpu_model = Some("max".to_string());
        }
        cfg.displays.extend(derive_display(architecture, target));
        cfg.networks.extend(derive_network(architecture, target));
        cfg.drives.push(derive_drive(architecture, target, true));
        cfg.sharing = derive_sharing(architecture, target);
        cfg.input = derive_input(architecture, target);
        cfg
    }
}
