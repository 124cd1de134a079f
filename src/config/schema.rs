//! VM configuration schema definitions
//!
//! In-memory names are snake_case; the JSON written to `vm.json` uses
//! PascalCase keys. Unknown keys are ignored on read and optional keys fall
//! back to the defaults documented on each field.

use crate::config::constants::*;
use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use uuid::Uuid;

/// Version written by this release.
pub const CONFIGURATION_VERSION: u32 = 1;

/// Accepted guest memory, in MiB.
pub const MEMORY_RANGE: RangeInclusive<u32> = 32..=65536;

/// Highest vCPU count; 0 means "let QEMU decide".
pub const MAX_CPU_COUNT: u16 = 128;

/// Highest number of USB redirection channels.
pub const MAX_USB_SHARE: u8 = 32;

const DEFAULT_MEMORY_MIB: u32 = 512;
const DEFAULT_USB_SHARE: u8 = 3;

/// VM configuration schema
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Configuration {
    pub configuration_version: u32,
    pub information: Information,
    pub system: SystemConfig,
    #[serde(default)]
    pub displays: Vec<DisplayConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
    #[serde(default)]
    pub sharing: SharingConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default, rename = "QEMU")]
    pub qemu: QemuTweaks,
}

/// Identity and user-facing metadata
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Information {
    /// Assigned once at creation, never reassigned.
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Icon reference; the file itself is managed elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Architecture, machine profile and sizing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SystemConfig {
    pub architecture: Architecture,
    pub target: Target,
    /// MiB, within [`MEMORY_RANGE`]. Defaults to 512 when absent.
    #[serde(default = "default_memory")]
    pub memory_size: u32,
    /// 0 keeps QEMU's default topology. Stored as a plain number so older
    /// bundles keep loading.
    #[serde(default, rename = "CPUCount")]
    pub cpu_count: u16,
    /// Passed through to `-cpu` verbatim.
    #[serde(default, rename = "CPU", skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
}

/// Settings for a single display
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DisplayConfig {
    pub hardware: DisplayDevice,
    /// Only honoured by VGA-class cards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vga_ram_mib: Option<u32>,
    #[serde(default = "yes", rename = "DynamicResolution")]
    pub is_dynamic_resolution: bool,
    #[serde(default)]
    pub upscaling_filter: Scaler,
    #[serde(default)]
    pub downscaling_filter: Scaler,
    #[serde(default, rename = "NativeResolution")]
    pub is_native_resolution: bool,
    #[serde(default)]
    pub frontend: DisplayFrontend,
}

/// How the guest display is presented on the host
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "Kind")]
pub enum DisplayFrontend {
    #[serde(rename = "gtk")]
    Gtk,
    #[serde(rename = "sdl")]
    Sdl,
    #[serde(rename = "vnc")]
    Vnc(Vnc),
    #[serde(rename = "spice")]
    Spice(Spice),
}

/// VNC configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Vnc {
    #[serde(default)]
    pub use_unix: bool,
    #[serde(default = "localhost")]
    pub host: String,
    #[serde(default)]
    pub display: u8,
    #[serde(default = "vnc_sock")]
    pub sock: PathBuf, // may be relative to the bundle
}

/// SPICE configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Spice {
    #[serde(default)]
    pub use_unix: bool,
    #[serde(default = "localhost")]
    pub addr: String,
    #[serde(default = "spice_port")]
    pub port: u16,
    #[serde(default = "yes")]
    pub disable_ticketing: bool,
    #[serde(default = "spice_sock")]
    pub sock: PathBuf, // may be relative to the bundle
}

/// One network card
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: NetworkMode,
    pub hardware: NetworkDevice,
    pub mac_address: String,
    #[serde(default, rename = "IsolateFromHost")]
    pub is_isolate_from_host: bool,
    /// Required when `mode` is bridged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_interface: Option<String>,
    /// Only used in emulated mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_forwards: Vec<PortForward>,
}

/// Host-to-guest port forward for emulated networking
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PortForward {
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
    pub host_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_address: Option<String>,
    pub guest_port: u16,
}

/// One drive
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DriveConfig {
    /// Relative paths live inside the bundle. Removable drives may be empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    pub image_type: ImageType,
    pub interface: DriveInterface,
    #[serde(default, rename = "External")]
    pub is_external: bool,
    #[serde(default, rename = "ReadOnly")]
    pub is_read_only: bool,
}

/// Directory and clipboard sharing settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct SharingConfig {
    #[serde(default)]
    pub directory_share_mode: ShareMode,
    /// Relative paths live inside the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_share_path: Option<PathBuf>,
    #[serde(default, rename = "DirectoryShareReadOnly")]
    pub is_directory_share_read_only: bool,
    #[serde(default, rename = "ClipboardSharing")]
    pub has_clipboard_sharing: bool,
}

/// USB controller and redirection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InputConfig {
    #[serde(default)]
    pub usb_bus_support: UsbBus,
    #[serde(default, rename = "UsbSharing")]
    pub has_usb_sharing: bool,
    #[serde(default = "default_usb_share")]
    pub maximum_usb_share: u8,
}

/// Independent QEMU switches; every one defaults to off
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct QemuTweaks {
    #[serde(default, rename = "UEFIBoot")]
    pub has_uefi_boot: bool,
    #[serde(default, rename = "RNGDevice")]
    pub has_rng_device: bool,
    #[serde(default, rename = "Hypervisor")]
    pub has_hypervisor: bool,
    #[serde(default, rename = "BalloonDevice")]
    pub has_balloon_device: bool,
    #[serde(default, rename = "TPMDevice")]
    pub has_tpm_device: bool,
    #[serde(default, rename = "RTCLocalTime")]
    pub has_rtc_local_time: bool,
    #[serde(default, rename = "DebugLog")]
    pub has_debug_log: bool,
}

fn default_memory() -> u32 {
    DEFAULT_MEMORY_MIB
}

fn default_usb_share() -> u8 {
    DEFAULT_USB_SHARE
}

fn yes() -> bool {
    true
}

fn localhost() -> String {
    "127.0.0.1".to_string()
}

fn spice_port() -> u16 {
    5930
}

fn vnc_sock() -> PathBuf {
    PathBuf::from("vnc.sock")
}

fn spice_sock() -> PathBuf {
    PathBuf::from("spice.sock")
}

impl Default for DisplayFrontend {
    fn default() -> Self {
        DisplayFrontend::Spice(Spice::default())
    }
}

impl Default for Vnc {
    fn default() -> Self {
        Vnc {
            use_unix: false,
            host: localhost(),
            display: 0,
            sock: vnc_sock(),
        }
    }
}

impl Default for Spice {
    fn default() -> Self {
        Spice {
            use_unix: false,
            addr: localhost(),
            port: spice_port(),
            disable_ticketing: true,
            sock: spice_sock(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            usb_bus_support: UsbBus::default(),
            has_usb_sharing: false,
            maximum_usb_share: DEFAULT_USB_SHARE,
        }
    }
}

impl DisplayConfig {
    pub fn new(hardware: DisplayDevice) -> Self {
        DisplayConfig {
            hardware,
            vga_ram_mib: None,
            is_dynamic_resolution: true,
            upscaling_filter: Scaler::Linear,
            downscaling_filter: Scaler::Linear,
            is_native_resolution: false,
            frontend: DisplayFrontend::default(),
        }
    }
}

impl NetworkConfig {
    /// Emulated card with a freshly generated MAC address.
    pub fn new(hardware: NetworkDevice) -> Self {
        NetworkConfig {
            mode: NetworkMode::Emulated,
            hardware,
            mac_address: crate::utils::system::random_mac(),
            is_isolate_from_host: false,
            bridge_interface: None,
            port_forwards: Vec::new(),
        }
    }
}

impl SystemConfig {
    /// `cpu_count` with the 0 sentinel mapped to `None`.
    pub fn smp(&self) -> Option<u16> {
        (self.cpu_count > 0).then_some(self.cpu_count)
    }

    /// Store a memory size, clamped into [`MEMORY_RANGE`]. Returns the value
    /// actually stored.
    pub fn set_memory_size(&mut self, mib: u32) -> u32 {
        self.memory_size = mib.clamp(*MEMORY_RANGE.start(), *MEMORY_RANGE.end());
        self.memory_size
    }

    /// Store a vCPU count, clamped to [`MAX_CPU_COUNT`]. 0 stays 0.
    pub fn set_cpu_count(&mut self, count: u16) -> u16 {
        self.cpu_count = count.min(MAX_CPU_COUNT);
        self.cpu_count
    }
}

impl InputConfig {
    pub fn set_maximum_usb_share(&mut self, count: u8) -> u8 {
        self.maximum_usb_share = count.min(MAX_USB_SHARE);
        self.maximum_usb_share
    }
}

impl Configuration {
    /// A bare configuration with a fresh identity and nothing attached.
    /// Use [`Configuration::with_defaults`] for a bootable one.
    pub fn new(name: impl Into<String>, architecture: Architecture, target: Target) -> Self {
        Configuration {
            configuration_version: CONFIGURATION_VERSION,
            information: Information {
                uuid: Uuid::new_v4(),
                name: name.into(),
                notes: None,
                icon: None,
            },
            system: SystemConfig {
                architecture,
                target,
                memory_size: architecture.default_memory(),
                cpu_count: 0,
                cpu_model: None,
            },
            displays: Vec::new(),
            networks: Vec::new(),
            drives: Vec::new(),
            sharing: SharingConfig::default(),
            input: InputConfig::default(),
            qemu: QemuTweaks::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.information.uuid
    }

    pub fn name(&self) -> &str {
        &self.information.name
    }

    pub fn architecture(&self) -> Architecture {
        self.system.architecture
    }

    /// Whether the display is served over SPICE. WebDAV sharing, the
    /// clipboard and USB redirection ride on its channels.
    pub fn uses_spice(&self) -> bool {
        matches!(
            self.displays.first().map(|d| &d.frontend),
            Some(DisplayFrontend::Spice(_))
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a `vm.json` document, rejecting versions newer than this
    /// release understands.
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        let cfg: Configuration = serde_json::from_str(text)?;
        if cfg.configuration_version > CONFIGURATION_VERSION {
            return Err(ParseError::UnsupportedVersion {
                found: cfg.configuration_version,
                supported: CONFIGURATION_VERSION,
            });
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        let mut cfg = Configuration::with_defaults("sample", Architecture::X86_64, Target::Q35);
        cfg.information.notes = Some("build box".into());
        cfg.system.cpu_model = Some("host".into());
        cfg.drives.push(DriveConfig {
            image_path: Some(PathBuf::from("disk.qcow2")),
            image_type: ImageType::Disk,
            interface: DriveInterface::Virtio,
            is_external: false,
            is_read_only: false,
        });
        cfg.networks[0].port_forwards.push(PortForward {
            protocol: Protocol::Tcp,
            host_address: Some("127.0.0.1".into()),
            host_port: 2222,
            guest_address: None,
            guest_port: 22,
        });
        cfg.qemu.has_rtc_local_time = true;
        cfg
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let cfg = sample();
        let json = cfg.to_json().unwrap();
        let parsed = Configuration::from_json(&json).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn test_round_trip_with_absent_optionals() {
        let cfg = Configuration::new("bare", Architecture::S390x, Target::S390CcwVirtio);
        let json = cfg.to_json().unwrap();
        assert!(!json.contains("Notes"));
        assert_eq!(Configuration::from_json(&json).unwrap(), cfg);
    }

    #[test]
    fn test_keys_are_pascal_case() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"ConfigurationVersion\": 1"));
        assert!(json.contains("\"UUID\""));
        assert!(json.contains("\"DirectoryShareMode\": \"webdav\""));
        assert!(json.contains("\"RTCLocalTime\": true"));
        assert!(json.contains("\"Kind\": \"spice\""));
    }

    #[test]
    fn test_unknown_keys_ignored_and_defaults_applied() {
        let json = r#"{
            "ConfigurationVersion": 1,
            "Backend": "QEMU",
            "Information": { "UUID": "6c9b4d52-0d1b-4b5e-9d55-4a3f3f1f0a11", "Name": "old", "IconCustom": false },
            "System": { "Architecture": "aarch64", "Target": "virt" }
        }"#;
        let cfg = Configuration::from_json(json).unwrap();
        assert_eq!(cfg.name(), "old");
        assert_eq!(cfg.system.memory_size, 512);
        assert_eq!(cfg.system.cpu_count, 0);
        assert!(cfg.displays.is_empty());
        assert_eq!(cfg.sharing.directory_share_mode, ShareMode::None);
        assert_eq!(cfg.input.maximum_usb_share, 3);
        assert_eq!(cfg.qemu, QemuTweaks::default());
    }

    #[test]
    fn test_missing_discriminant_fails() {
        let json = r#"{
            "ConfigurationVersion": 1,
            "Information": { "UUID": "6c9b4d52-0d1b-4b5e-9d55-4a3f3f1f0a11", "Name": "x" },
            "System": { "Target": "virt" }
        }"#;
        assert!(matches!(Configuration::from_json(json), Err(ParseError::Json(_))));

        let no_version = r#"{
            "Information": { "UUID": "6c9b4d52-0d1b-4b5e-9d55-4a3f3f1f0a11", "Name": "x" },
            "System": { "Architecture": "aarch64", "Target": "virt" }
        }"#;
        assert!(Configuration::from_json(no_version).is_err());
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut cfg = sample();
        cfg.configuration_version = CONFIGURATION_VERSION + 1;
        let json = cfg.to_json().unwrap();
        assert!(matches!(
            Configuration::from_json(&json),
            Err(ParseError::UnsupportedVersion { found: 2, supported: 1 })
        ));
    }

    #[test]
    fn test_setters_clamp() {
        let mut cfg = Configuration::new("c", Architecture::X86_64, Target::Q35);
        assert_eq!(cfg.system.set_memory_size(8), 32);
        assert_eq!(cfg.system.set_memory_size(1 << 20), 65536);
        assert_eq!(cfg.system.set_cpu_count(500), 128);
        assert_eq!(cfg.system.set_cpu_count(0), 0);
        assert_eq!(cfg.system.smp(), None);
        assert_eq!(cfg.input.set_maximum_usb_share(99), 32);
    }

    #[test]
    fn test_new_assigns_distinct_identities() {
        let a = Configuration::new("a", Architecture::X86_64, Target::Q35);
        let b = Configuration::new("a", Architecture::X86_64, Target::Q35);
        assert_ne!(a.id(), b.id());
    }
}
