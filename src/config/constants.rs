//! Hardware identifier tables
//!
//! Every identifier QEMU accepts is modelled as a closed enum with a fixed
//! wire string. Which identifiers an architecture accepts is answered by the
//! tables on [`Architecture`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parse failure for a wire-format identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownIdentifier {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant, )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Identifier as QEMU spells it.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownIdentifier;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| UnknownIdentifier {
                        kind: stringify!($name),
                        value: s.to_string(),
                    })
            }
        }
    };
}

wire_enum! {
    /// Guest architecture, named after the `qemu-system-*` suffix.
    pub enum Architecture {
        I386 => "i386",
        X86_64 => "x86_64",
        Arm => "arm",
        Aarch64 => "aarch64",
        M68k => "m68k",
        Ppc => "ppc",
        Ppc64 => "ppc64",
        Riscv64 => "riscv64",
        Sparc => "sparc",
        S390x => "s390x",
    }
}

wire_enum! {
    /// Machine profile passed to `-machine`.
    pub enum Target {
        /// i440FX chipset.
        Pc => "pc",
        /// ICH9 chipset.
        Q35 => "q35",
        /// ISA-only legacy PC.
        Isapc => "isapc",
        /// Generic paravirtual board.
        Virt => "virt",
        /// Macintosh Quadra 800.
        Q800 => "q800",
        Mac99 => "mac99",
        G3beige => "g3beige",
        Pseries => "pseries",
        Ss5 => "SS-5",
        S390CcwVirtio => "s390-ccw-virtio",
    }
}

wire_enum! {
    /// Emulated graphics card.
    pub enum DisplayDevice {
        Vga => "VGA",
        CirrusVga => "cirrus-vga",
        VirtioVga => "virtio-vga",
        IsaVga => "isa-vga",
        QxlVga => "qxl-vga",
        BochsDisplay => "bochs-display",
        VirtioGpuPci => "virtio-gpu-pci",
        VirtioRamfb => "virtio-ramfb",
        Ramfb => "ramfb",
        NubusMacfb => "nubus-macfb",
        Tcx => "tcx",
        Cg3 => "cg3",
    }
}

wire_enum! {
    /// Emulated network card.
    pub enum NetworkDevice {
        Rtl8139 => "rtl8139",
        E1000 => "e1000",
        VirtioNetPci => "virtio-net-pci",
        Pcnet => "pcnet",
        Ne2kIsa => "ne2k_isa",
        Dp8393x => "dp8393x",
        Sungem => "sungem",
        Lance => "lance",
        VirtioNetCcw => "virtio-net-ccw",
    }
}

wire_enum! {
    /// Bus a drive is attached to.
    pub enum DriveInterface {
        Ide => "ide",
        Scsi => "scsi",
        Sd => "sd",
        Floppy => "floppy",
        Pflash => "pflash",
        Virtio => "virtio",
        Nvme => "nvme",
        Usb => "usb",
    }
}

wire_enum! {
    /// What the backing image holds.
    pub enum ImageType {
        Disk => "disk",
        Cd => "cd",
        /// UEFI variable store.
        EfiVars => "efi-vars",
    }
}

wire_enum! {
    pub enum NetworkMode {
        /// User-mode (SLIRP) networking.
        Emulated => "emulated",
        Bridged => "bridged",
        None => "none",
    }
}

wire_enum! {
    /// Directory sharing protocol.
    pub enum ShareMode {
        None => "none",
        /// SPICE WebDAV channel, served by the display client.
        Webdav => "webdav",
        /// 9p filesystem passthrough.
        Virtfs => "virtfs",
    }
}

wire_enum! {
    pub enum UsbBus {
        Disabled => "disabled",
        Usb2 => "2.0",
        Usb3 => "3.0",
    }
}

wire_enum! {
    pub enum Scaler {
        Linear => "linear",
        Nearest => "nearest",
    }
}

wire_enum! {
    /// Transport of a forwarded port.
    pub enum Protocol {
        Tcp => "tcp",
        Udp => "udp",
    }
}

impl Default for ShareMode {
    fn default() -> Self {
        ShareMode::None
    }
}

impl Default for UsbBus {
    fn default() -> Self {
        UsbBus::Usb2
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Scaler::Linear
    }
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Emulated
    }
}

const X86_DISPLAYS: &[DisplayDevice] = &[
    DisplayDevice::Vga,
    DisplayDevice::CirrusVga,
    DisplayDevice::VirtioVga,
    DisplayDevice::IsaVga,
    DisplayDevice::QxlVga,
    DisplayDevice::BochsDisplay,
    DisplayDevice::VirtioGpuPci,
    DisplayDevice::Ramfb,
];
const ARM_DISPLAYS: &[DisplayDevice] = &[
    DisplayDevice::VirtioRamfb,
    DisplayDevice::VirtioGpuPci,
    DisplayDevice::Ramfb,
    DisplayDevice::BochsDisplay,
    DisplayDevice::Vga,
];
const PPC_DISPLAYS: &[DisplayDevice] = &[
    DisplayDevice::Vga,
    DisplayDevice::BochsDisplay,
    DisplayDevice::VirtioGpuPci,
];
const RISCV_DISPLAYS: &[DisplayDevice] = &[
    DisplayDevice::VirtioGpuPci,
    DisplayDevice::Vga,
    DisplayDevice::BochsDisplay,
    DisplayDevice::Ramfb,
];

const X86_NICS: &[NetworkDevice] = &[
    NetworkDevice::Rtl8139,
    NetworkDevice::E1000,
    NetworkDevice::VirtioNetPci,
    NetworkDevice::Pcnet,
    NetworkDevice::Ne2kIsa,
];
const VIRT_NICS: &[NetworkDevice] = &[
    NetworkDevice::VirtioNetPci,
    NetworkDevice::E1000,
    NetworkDevice::Rtl8139,
];
const PPC_NICS: &[NetworkDevice] = &[
    NetworkDevice::Sungem,
    NetworkDevice::Rtl8139,
    NetworkDevice::E1000,
    NetworkDevice::VirtioNetPci,
];

const X86_DRIVES: &[DriveInterface] = &[
    DriveInterface::Ide,
    DriveInterface::Scsi,
    DriveInterface::Virtio,
    DriveInterface::Nvme,
    DriveInterface::Usb,
    DriveInterface::Floppy,
    DriveInterface::Pflash,
];
const ARM_DRIVES: &[DriveInterface] = &[
    DriveInterface::Virtio,
    DriveInterface::Scsi,
    DriveInterface::Nvme,
    DriveInterface::Usb,
    DriveInterface::Sd,
    DriveInterface::Pflash,
];
const RISCV_DRIVES: &[DriveInterface] = &[
    DriveInterface::Virtio,
    DriveInterface::Scsi,
    DriveInterface::Nvme,
    DriveInterface::Usb,
    DriveInterface::Pflash,
];
const PPC_DRIVES: &[DriveInterface] = &[
    DriveInterface::Ide,
    DriveInterface::Scsi,
    DriveInterface::Usb,
    DriveInterface::Virtio,
];

impl Architecture {
    /// Machine profiles this architecture can boot.
    pub fn targets(self) -> &'static [Target] {
        use Architecture::*;
        match self {
            I386 | X86_64 => &[Target::Q35, Target::Pc, Target::Isapc],
            Arm | Aarch64 | Riscv64 => &[Target::Virt],
            M68k => &[Target::Q800],
            Ppc => &[Target::Mac99, Target::G3beige],
            Ppc64 => &[Target::Pseries, Target::Mac99],
            Sparc => &[Target::Ss5],
            S390x => &[Target::S390CcwVirtio],
        }
    }

    pub fn default_target(self) -> Target {
        self.targets()[0]
    }

    pub fn supports_target(self, target: Target) -> bool {
        self.targets().contains(&target)
    }

    pub fn display_devices(self) -> &'static [DisplayDevice] {
        use Architecture::*;
        match self {
            I386 | X86_64 => X86_DISPLAYS,
            Arm | Aarch64 => ARM_DISPLAYS,
            M68k => &[DisplayDevice::NubusMacfb],
            Ppc | Ppc64 => PPC_DISPLAYS,
            Riscv64 => RISCV_DISPLAYS,
            Sparc => &[DisplayDevice::Tcx, DisplayDevice::Cg3],
            S390x => &[],
        }
    }

    pub fn network_devices(self) -> &'static [NetworkDevice] {
        use Architecture::*;
        match self {
            I386 | X86_64 => X86_NICS,
            Arm | Aarch64 | Riscv64 => VIRT_NICS,
            M68k => &[NetworkDevice::Dp8393x],
            Ppc | Ppc64 => PPC_NICS,
            Sparc => &[NetworkDevice::Lance],
            S390x => &[NetworkDevice::VirtioNetCcw],
        }
    }

    pub fn drive_interfaces(self) -> &'static [DriveInterface] {
        use Architecture::*;
        match self {
            I386 | X86_64 => X86_DRIVES,
            Arm | Aarch64 => ARM_DRIVES,
            Riscv64 => RISCV_DRIVES,
            M68k | Sparc => &[DriveInterface::Scsi],
            Ppc | Ppc64 => PPC_DRIVES,
            S390x => &[DriveInterface::Virtio],
        }
    }

    /// Whether a guest agent (spice-vdagent / qemu-ga) exists for guests of
    /// this architecture. Resolution resize and clipboard depend on it.
    pub fn has_agent_support(self) -> bool {
        !matches!(self, Architecture::M68k | Architecture::Sparc | Architecture::S390x)
    }

    /// 9p transport device, if the architecture has one.
    pub fn virtfs_device(self) -> Option<&'static str> {
        use Architecture::*;
        match self {
            M68k => Some("virtio-9p-device"),
            S390x => Some("virtio-9p-ccw"),
            Sparc => None,
            _ => Some("virtio-9p-pci"),
        }
    }

    /// TPM frontend device, if the architecture has one.
    pub fn tpm_device(self) -> Option<&'static str> {
        use Architecture::*;
        match self {
            I386 | X86_64 => Some("tpm-tis"),
            Arm | Aarch64 => Some("tpm-tis-device"),
            Ppc64 => Some("tpm-spapr"),
            _ => None,
        }
    }

    /// RNG and balloon devices live on PCI everywhere but s390x.
    pub fn pci_suffix(self) -> &'static str {
        match self {
            Architecture::S390x => "ccw",
            _ => "pci",
        }
    }

    /// Memory size in MiB for a fresh VM.
    pub fn default_memory(self) -> u32 {
        use Architecture::*;
        match self {
            X86_64 | Aarch64 | Riscv64 | Ppc64 | S390x => 2048,
            I386 | Arm | Ppc => 1024,
            M68k => 128,
            Sparc => 256,
        }
    }

    /// USB controller a fresh VM gets on a board with PCI.
    pub fn default_usb_bus(self) -> UsbBus {
        use Architecture::*;
        match self {
            I386 | X86_64 | Arm | Aarch64 | Riscv64 => UsbBus::Usb3,
            Ppc | Ppc64 => UsbBus::Usb2,
            M68k | Sparc | S390x => UsbBus::Disabled,
        }
    }

    /// Executable name, `qemu-system-<arch>`.
    pub fn qemu_binary(self) -> String {
        format!("qemu-system-{}", self.as_str())
    }
}

impl Target {
    /// Boards without a PCI bus, where PCI controllers such as the USB
    /// host adapters cannot be plugged.
    pub fn has_pci_bus(self) -> bool {
        !matches!(self, Target::Isapc | Target::Q800 | Target::Ss5)
    }
}

impl DisplayDevice {
    /// Cards that take a `vgamem_mb` property.
    pub fn accepts_vga_ram(self) -> bool {
        matches!(
            self,
            DisplayDevice::Vga | DisplayDevice::CirrusVga | DisplayDevice::IsaVga | DisplayDevice::QxlVga
        )
    }

    /// Framebuffers wired into the board itself; nothing to add on the
    /// command line.
    pub fn is_builtin(self) -> bool {
        self == DisplayDevice::NubusMacfb
    }

    /// Sun framebuffers are picked with `-vga` instead of `-device`.
    pub fn vga_option(self) -> Option<&'static str> {
        match self {
            DisplayDevice::Tcx | DisplayDevice::Cg3 => Some(self.as_str()),
            _ => None,
        }
    }
}

impl NetworkDevice {
    /// Board-integrated NICs cannot be created with `-device`.
    pub fn is_onboard(self) -> bool {
        matches!(self, NetworkDevice::Dp8393x | NetworkDevice::Lance)
    }
}

impl DriveInterface {
    /// Value for `-drive if=`. Interfaces that need an explicit `-device`
    /// use `none`.
    pub fn drive_if(self) -> &'static str {
        match self {
            DriveInterface::Nvme | DriveInterface::Usb => "none",
            other => other.as_str(),
        }
    }

    pub fn supports(self, image_type: ImageType) -> bool {
        match image_type {
            ImageType::EfiVars => self == DriveInterface::Pflash,
            ImageType::Cd => !matches!(
                self,
                DriveInterface::Pflash | DriveInterface::Nvme | DriveInterface::Sd | DriveInterface::Floppy
            ),
            ImageType::Disk => self != DriveInterface::Pflash,
        }
    }
}

impl ImageType {
    /// Value for `-drive media=`.
    pub fn media(self) -> &'static str {
        match self {
            ImageType::Cd => "cdrom",
            ImageType::Disk | ImageType::EfiVars => "disk",
        }
    }
}
