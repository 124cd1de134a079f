//! QEMU command-line compilation
//!
//! Turns a [`Configuration`] snapshot into the argument vector for
//! `qemu-system-<arch>`. Sections are emitted in a fixed order: system,
//! memory/CPU, display, drives, networks, sharing, input, tweaks. Every
//! section is a plain function of the configuration plus the two directories
//! held by the compiler, so the same input always yields the same tokens.

use crate::config::constants::{DriveInterface, ImageType, NetworkMode, ShareMode, UsbBus};
use crate::config::schema::*;
use crate::error::CompileError;
use crate::utils::paths::resolve_under_root;
use crate::vm::firmware::firmware_files;
use std::path::{Path, PathBuf};

const USB_BUS: &str = "usb-bus.0";

/// Compiles configurations for one bundle.
#[derive(Debug, Clone)]
pub struct ArgumentCompiler {
    firmware_dir: PathBuf,
    bundle_dir: PathBuf,
}

impl ArgumentCompiler {
    pub fn new(firmware_dir: impl Into<PathBuf>, bundle_dir: impl Into<PathBuf>) -> Self {
        ArgumentCompiler {
            firmware_dir: firmware_dir.into(),
            bundle_dir: bundle_dir.into(),
        }
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// Build the full argument vector, or the first reason it cannot be built.
    pub fn compile(&self, cfg: &Configuration) -> Result<Vec<String>, CompileError> {
        let mut args = system_args(cfg)?;
        args.extend(memory_args(cfg));
        args.extend(self.display_args(cfg)?);
        args.extend(self.drive_args(cfg)?);
        args.extend(network_args(cfg)?);
        args.extend(self.sharing_args(cfg)?);
        args.extend(input_args(cfg)?);
        args.extend(self.tweak_args(cfg)?);
        Ok(args)
    }

    fn path_arg(&self, p: &Path) -> String {
        escape(&resolve_under_root(&self.bundle_dir, p))
    }

    fn display_args(&self, cfg: &Configuration) -> Result<Vec<String>, CompileError> {
        let arch = cfg.system.architecture;
        let display = match cfg.displays.as_slice() {
            [] => return Ok(vec!["-nographic".into()]),
            [one] => one,
            many => return Err(CompileError::TooManyDisplays(many.len())),
        };
        if !arch.display_devices().contains(&display.hardware) {
            return Err(CompileError::UnsupportedDisplay {
                architecture: arch,
                device: display.hardware,
            });
        }

        let hw = display.hardware;
        let mut base: Vec<String> = if hw.is_builtin() {
            Vec::new()
        } else if let Some(vga) = hw.vga_option() {
            vec!["-vga".into(), vga.into()]
        } else {
            let mut device = hw.as_str().to_string();
            if let Some(mib) = display.vga_ram_mib.filter(|_| hw.accepts_vga_ram()) {
                device.push_str(&format!(",vgamem_mb={mib}"));
            }
            vec!["-vga".into(), "none".into(), "-device".into(), device]
        };

        let mut v: Vec<String> = match &display.frontend {
            DisplayFrontend::Gtk => vec!["-display".into(), "gtk".into()],
            DisplayFrontend::Sdl => vec!["-display".into(), "sdl".into()],
            DisplayFrontend::Vnc(vnc) => {
                let target = if vnc.use_unix {
                    format!("unix:{}", self.path_arg(&vnc.sock))
                } else {
                    format!("{}:{}", vnc.host, vnc.display)
                };
                vec!["-display".into(), "none".into(), "-vnc".into(), target]
            }
            DisplayFrontend::Spice(spice) => {
                let ticketing = if spice.disable_ticketing { "on" } else { "off" };
                let endpoint = if spice.use_unix {
                    format!("unix=on,addr={}", self.path_arg(&spice.sock))
                } else {
                    format!("addr={},port={}", spice.addr, spice.port)
                };
                vec![
                    "-display".into(),
                    "none".into(),
                    "-spice".into(),
                    format!(
                        "{endpoint},disable-ticketing={ticketing},image-compression=off,playback-compression=off,streaming-video=off"
                    ),
                ]
            }
        };

        base.append(&mut v);
        Ok(base)
    }

    fn drive_args(&self, cfg: &Configuration) -> Result<Vec<String>, CompileError> {
        let arch = cfg.system.architecture;
        let mut v = Vec::new();
        for (index, drive) in cfg.drives.iter().enumerate() {
            if !arch.drive_interfaces().contains(&drive.interface) {
                return Err(CompileError::UnsupportedDriveInterface {
                    index,
                    architecture: arch,
                    interface: drive.interface,
                });
            }
            if !drive.interface.supports(drive.image_type) {
                return Err(CompileError::UnsupportedDriveCombination {
                    index,
                    interface: drive.interface,
                    image_type: drive.image_type,
                });
            }
            if drive.image_type == ImageType::EfiVars && firmware_files(arch).is_none() {
                return Err(CompileError::UefiUnsupported { architecture: arch });
            }
            if drive.image_type == ImageType::EfiVars && !cfg.qemu.has_uefi_boot {
                return Err(CompileError::EfiVarsWithoutUefi { index });
            }
            if !drive.is_external && drive.image_path.is_none() {
                return Err(CompileError::MissingImage { index });
            }

            let id = format!("drive{index}");
            let mut opts = if drive.image_type == ImageType::EfiVars {
                format!("if=pflash,format=raw,unit=1,id={id}")
            } else {
                format!(
                    "if={},media={},id={id}",
                    drive.interface.drive_if(),
                    drive.image_type.media()
                )
            };
            if let Some(path) = &drive.image_path {
                opts.push_str(&format!(",file={}", self.path_arg(path)));
            }
            if drive.is_read_only {
                opts.push_str(",readonly=on");
            }
            v.push("-drive".into());
            v.push(opts);

            if drive.interface == DriveInterface::Nvme {
                v.push("-device".into());
                v.push(format!("nvme,drive={id},serial={id}"));
            }
        }
        Ok(v)
    }

    fn sharing_args(&self, cfg: &Configuration) -> Result<Vec<String>, CompileError> {
        let arch = cfg.system.architecture;
        let sharing = &cfg.sharing;
        let mode = sharing.directory_share_mode;
        let webdav = mode == ShareMode::Webdav;
        let clipboard = sharing.has_clipboard_sharing;

        let share_path = match mode {
            ShareMode::None => None,
            _ => Some(
                sharing
                    .directory_share_path
                    .as_deref()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(CompileError::MissingSharePath(mode))?,
            ),
        };

        let mut v: Vec<String> = Vec::new();
        if webdav || clipboard {
            if webdav && !cfg.uses_spice() {
                return Err(CompileError::SpiceRequired {
                    feature: "directory sharing via webdav",
                });
            }
            if clipboard && !cfg.uses_spice() {
                return Err(CompileError::SpiceRequired {
                    feature: "clipboard sharing",
                });
            }
            v.extend(["-device".into(), format!("virtio-serial-{}", arch.pci_suffix())]);
        }
        if webdav {
            v.extend([
                "-chardev".into(),
                "spiceport,name=org.spice-space.webdav.0,id=charchannel1".into(),
                "-device".into(),
                "virtserialport,chardev=charchannel1,id=channel1,name=org.spice-space.webdav.0".into(),
            ]);
        }
        if clipboard {
            v.extend([
                "-chardev".into(),
                "spicevmc,id=vdagent,debug=0,name=vdagent".into(),
                "-device".into(),
                "virtserialport,chardev=vdagent,name=com.redhat.spice.0".into(),
            ]);
        }
        if let (ShareMode::Virtfs, Some(path)) = (mode, share_path) {
            let device = arch
                .virtfs_device()
                .ok_or(CompileError::VirtfsUnsupported { architecture: arch })?;
            let mut fsdev = format!(
                "local,id=virtfs0,path={},security_model=mapped-xattr",
                self.path_arg(path)
            );
            if sharing.is_directory_share_read_only {
                fsdev.push_str(",readonly=on");
            }
            v.extend([
                "-fsdev".into(),
                fsdev,
                "-device".into(),
                format!("{device},fsdev=virtfs0,mount_tag=share"),
            ]);
        }
        Ok(v)
    }

    fn tweak_args(&self, cfg: &Configuration) -> Result<Vec<String>, CompileError> {
        let arch = cfg.system.architecture;
        let tweaks = &cfg.qemu;
        let mut v: Vec<String> = Vec::new();

        if tweaks.has_uefi_boot {
            let files = firmware_files(arch).ok_or(CompileError::UefiUnsupported { architecture: arch })?;
            v.extend([
                "-drive".into(),
                format!(
                    "if=pflash,format=raw,unit=0,readonly=on,file={}",
                    escape(&self.firmware_dir.join(files.code))
                ),
            ]);
        }
        if tweaks.has_rng_device {
            v.extend(["-device".into(), format!("virtio-rng-{}", arch.pci_suffix())]);
        }
        if tweaks.has_hypervisor {
            v.extend(["-accel".into(), "kvm".into()]);
        }
        if tweaks.has_balloon_device {
            v.extend(["-device".into(), format!("virtio-balloon-{}", arch.pci_suffix())]);
        }
        if tweaks.has_tpm_device {
            let device = arch
                .tpm_device()
                .ok_or(CompileError::TpmUnsupported { architecture: arch })?;
            v.extend([
                "-chardev".into(),
                format!("socket,id=chrtpm,path={}", escape(&self.bundle_dir.join("swtpm.sock"))),
                "-tpmdev".into(),
                "emulator,id=tpm0,chardev=chrtpm".into(),
                "-device".into(),
                format!("{device},tpmdev=tpm0"),
            ]);
        }
        if tweaks.has_rtc_local_time {
            v.extend(["-rtc".into(), "base=localtime".into()]);
        }
        if tweaks.has_debug_log {
            v.extend([
                "-d".into(),
                "guest_errors,unimp".into(),
                "-D".into(),
                escape(&self.bundle_dir.join("debug.log")),
            ]);
        }
        Ok(v)
    }
}

fn system_args(cfg: &Configuration) -> Result<Vec<String>, CompileError> {
    let system = &cfg.system;
    if !system.architecture.supports_target(system.target) {
        return Err(CompileError::TargetMismatch {
            architecture: system.architecture,
            target: system.target,
        });
    }
    let mut v = vec![
        "-name".into(),
        cfg.name().to_string(),
        "-uuid".into(),
        cfg.id().to_string(),
        "-machine".into(),
        system.target.to_string(),
    ];
    if let Some(model) = &system.cpu_model {
        v.extend(["-cpu".into(), model.clone()]);
    }
    Ok(v)
}

fn memory_args(cfg: &Configuration) -> Vec<String> {
    let mut v = vec!["-m".into(), cfg.system.memory_size.to_string()];
    if let Some(cpus) = cfg.system.smp() {
        v.extend(["-smp".into(), format!("cpus={cpus}")]);
    }
    v
}

fn network_args(cfg: &Configuration) -> Result<Vec<String>, CompileError> {
    let arch = cfg.system.architecture;
    let mut v: Vec<String> = Vec::new();
    for (index, net) in cfg.networks.iter().enumerate() {
        if net.mode == NetworkMode::None {
            continue;
        }
        if !arch.network_devices().contains(&net.hardware) {
            return Err(CompileError::UnsupportedNetwork {
                index,
                architecture: arch,
                device: net.hardware,
            });
        }

        let id = format!("net{index}");
        let netdev = match net.mode {
            NetworkMode::Bridged => {
                let bridge = net
                    .bridge_interface
                    .as_deref()
                    .filter(|b| !b.trim().is_empty())
                    .ok_or(CompileError::MissingBridgeInterface { index })?;
                format!("bridge,id={id},br={bridge}")
            }
            _ => {
                let mut s = format!("user,id={id}");
                if net.is_isolate_from_host {
                    s.push_str(",restrict=on");
                }
                for fwd in &net.port_forwards {
                    s.push_str(&format!(
                        ",hostfwd={}:{}:{}-{}:{}",
                        fwd.protocol,
                        fwd.host_address.as_deref().unwrap_or(""),
                        fwd.host_port,
                        fwd.guest_address.as_deref().unwrap_or(""),
                        fwd.guest_port
                    ));
                }
                s
            }
        };
        v.extend(["-netdev".into(), netdev]);

        if net.hardware.is_onboard() {
            v.extend([
                "-net".into(),
                format!("nic,model={},netdev={id},macaddr={}", net.hardware, net.mac_address),
            ]);
        } else {
            v.extend([
                "-device".into(),
                format!("{},mac={},netdev={id}", net.hardware, net.mac_address),
            ]);
        }
    }

    if v.is_empty() {
        v = vec!["-nic".into(), "none".into()];
    }
    Ok(v)
}

fn input_args(cfg: &Configuration) -> Result<Vec<String>, CompileError> {
    let input = &cfg.input;
    let usb_drives: Vec<(usize, &DriveConfig)> = cfg
        .drives
        .iter()
        .enumerate()
        .filter(|(_, d)| d.interface == DriveInterface::Usb)
        .collect();

    let controller = match input.usb_bus_support {
        UsbBus::Disabled => {
            if !usb_drives.is_empty() {
                return Err(CompileError::UsbBusRequired { feature: "USB drives" });
            }
            if input.has_usb_sharing {
                return Err(CompileError::UsbBusRequired { feature: "USB sharing" });
            }
            return Ok(Vec::new());
        }
        UsbBus::Usb2 => "usb-ehci,id=usb-bus",
        UsbBus::Usb3 => "qemu-xhci,id=usb-bus",
    };
    if !cfg.system.target.has_pci_bus() {
        return Err(CompileError::UsbControllerUnsupported {
            target: cfg.system.target,
        });
    }

    let mut v: Vec<String> = vec!["-device".into(), controller.into()];
    for device in ["usb-tablet", "usb-mouse", "usb-kbd"] {
        v.extend(["-device".into(), format!("{device},bus={USB_BUS}")]);
    }
    for (index, drive) in usb_drives {
        let mut dev = format!("usb-storage,drive=drive{index},bus={USB_BUS}");
        if drive.is_external {
            dev.push_str(",removable=on");
        }
        v.extend(["-device".into(), dev]);
    }
    if input.has_usb_sharing {
        if !cfg.uses_spice() {
            return Err(CompileError::SpiceRequired { feature: "USB sharing" });
        }
        for n in 0..input.maximum_usb_share {
            v.extend([
                "-chardev".into(),
                format!("spicevmc,name=usbredir,id=usbredirchardev{n}"),
                "-device".into(),
                format!("usb-redir,chardev=usbredirchardev{n},id=usbredirdev{n},bus={USB_BUS}"),
            ]);
        }
    }
    Ok(v)
}

/// QEMU option values split on ',', so literal commas are doubled.
fn escape(p: &Path) -> String {
    p.display().to_string().replace(',', ",,")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::*;

    fn compiler() -> ArgumentCompiler {
        ArgumentCompiler::new("/fw", "/vms/test.qvm")
    }

    fn bare(arch: Architecture, target: Target) -> Configuration {
        let mut cfg = Configuration::new("test", arch, target);
        cfg.input.usb_bus_support = UsbBus::Disabled;
        cfg
    }

    fn window<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_bare_config_is_headless_without_network() {
        let cfg = bare(Architecture::Sparc, Target::Ss5);
        let args = compiler().compile(&cfg).unwrap();
        let expected: Vec<String> = [
            "-name", "test", "-uuid", &cfg.id().to_string(), "-machine", "SS-5",
            "-m", "256", "-nographic", "-nic", "none",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_memory_and_cpu() {
        let mut cfg = bare(Architecture::Sparc, Target::Ss5);
        cfg.system.cpu_count = 4;
        cfg.system.cpu_model = Some("TI-SuperSparc-II".into());
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(window(&args, "-smp"), ["cpus=4"]);
        assert_eq!(window(&args, "-cpu"), ["TI-SuperSparc-II"]);
    }

    #[test]
    fn test_target_mismatch() {
        let cfg = bare(Architecture::Aarch64, Target::Q35);
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn test_vga_ram_only_on_vga_class() {
        let mut cfg = bare(Architecture::X86_64, Target::Pc);
        let mut display = DisplayConfig::new(DisplayDevice::Vga);
        display.vga_ram_mib = Some(64);
        display.frontend = DisplayFrontend::Gtk;
        cfg.displays.push(display.clone());
        let args = compiler().compile(&cfg).unwrap();
        assert!(args.contains(&"VGA,vgamem_mb=64".to_string()));
        assert_eq!(window(&args, "-display"), ["gtk"]);

        cfg.displays[0].hardware = DisplayDevice::VirtioGpuPci;
        let args = compiler().compile(&cfg).unwrap();
        assert!(args.contains(&"virtio-gpu-pci".to_string()));
    }

    #[test]
    fn test_board_displays() {
        let mut cfg = bare(Architecture::Sparc, Target::Ss5);
        let mut display = DisplayConfig::new(DisplayDevice::Cg3);
        display.frontend = DisplayFrontend::Sdl;
        cfg.displays.push(display);
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(window(&args, "-vga"), ["cg3"]);

        let mut cfg = bare(Architecture::M68k, Target::Q800);
        cfg.displays.push(DisplayConfig::new(DisplayDevice::NubusMacfb));
        let args = compiler().compile(&cfg).unwrap();
        assert!(window(&args, "-vga").is_empty());
        assert!(window(&args, "-device").is_empty());
    }

    #[test]
    fn test_vnc_and_spice_frontends() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        let mut display = DisplayConfig::new(DisplayDevice::VirtioVga);
        display.frontend = DisplayFrontend::Vnc(Vnc {
            use_unix: true,
            ..Vnc::default()
        });
        cfg.displays.push(display);
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(window(&args, "-vnc"), ["unix:/vms/test.qvm/vnc.sock"]);

        cfg.displays[0].frontend = DisplayFrontend::Spice(Spice {
            port: 6000,
            disable_ticketing: false,
            ..Spice::default()
        });
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-spice"),
            ["addr=127.0.0.1,port=6000,disable-ticketing=off,image-compression=off,playback-compression=off,streaming-video=off"]
        );
    }

    #[test]
    fn test_drives_and_escaping() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        cfg.drives.push(DriveConfig {
            image_path: Some(PathBuf::from("disk,1.qcow2")),
            image_type: ImageType::Disk,
            interface: DriveInterface::Nvme,
            is_external: false,
            is_read_only: false,
        });
        cfg.drives.push(DriveConfig {
            image_path: None,
            image_type: ImageType::Cd,
            interface: DriveInterface::Ide,
            is_external: true,
            is_read_only: true,
        });
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-drive"),
            [
                "if=none,media=disk,id=drive0,file=/vms/test.qvm/disk,,1.qcow2",
                "if=ide,media=cdrom,id=drive1,readonly=on",
            ]
        );
        assert_eq!(window(&args, "-device"), ["nvme,drive=drive0,serial=drive0"]);
    }

    #[test]
    fn test_drive_errors() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        cfg.drives.push(DriveConfig {
            image_path: None,
            image_type: ImageType::Disk,
            interface: DriveInterface::Virtio,
            is_external: false,
            is_read_only: false,
        });
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::MissingImage { index: 0 })
        ));

        cfg.drives[0].interface = DriveInterface::Sd;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::UnsupportedDriveInterface { index: 0, .. })
        ));

        cfg.drives[0].interface = DriveInterface::Floppy;
        cfg.drives[0].image_type = ImageType::Cd;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::UnsupportedDriveCombination { index: 0, .. })
        ));
    }

    #[test]
    fn test_networks() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        let mut net = NetworkConfig::new(NetworkDevice::E1000);
        net.mac_address = "52:54:00:12:34:56".into();
        net.is_isolate_from_host = true;
        net.port_forwards.push(PortForward {
            protocol: Protocol::Tcp,
            host_address: None,
            host_port: 2222,
            guest_address: None,
            guest_port: 22,
        });
        cfg.networks.push(net);
        let mut bridged = NetworkConfig::new(NetworkDevice::VirtioNetPci);
        bridged.mode = NetworkMode::Bridged;
        bridged.mac_address = "52:54:00:ab:cd:ef".into();
        bridged.bridge_interface = Some("br0".into());
        cfg.networks.push(bridged);

        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-netdev"),
            ["user,id=net0,restrict=on,hostfwd=tcp::2222-:22", "bridge,id=net1,br=br0"]
        );
        assert_eq!(
            window(&args, "-device"),
            [
                "e1000,mac=52:54:00:12:34:56,netdev=net0",
                "virtio-net-pci,mac=52:54:00:ab:cd:ef,netdev=net1",
            ]
        );

        cfg.networks[1].bridge_interface = Some(" ".into());
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::MissingBridgeInterface { index: 1 })
        ));
    }

    #[test]
    fn test_onboard_nic_and_disabled_network() {
        let mut cfg = bare(Architecture::M68k, Target::Q800);
        let mut net = NetworkConfig::new(NetworkDevice::Dp8393x);
        net.mac_address = "52:54:00:00:00:01".into();
        cfg.networks.push(net);
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-net"),
            ["nic,model=dp8393x,netdev=net0,macaddr=52:54:00:00:00:01"]
        );

        cfg.networks[0].mode = NetworkMode::None;
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(window(&args, "-nic"), ["none"]);
    }

    #[test]
    fn test_sharing_needs_spice_and_path() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        cfg.sharing.has_clipboard_sharing = true;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::SpiceRequired { .. })
        ));

        cfg.displays.push(DisplayConfig::new(DisplayDevice::VirtioVga));
        cfg.sharing.directory_share_mode = ShareMode::Webdav;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::MissingSharePath(ShareMode::Webdav))
        ));

        cfg.sharing.directory_share_path = Some(PathBuf::from("Shared"));
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-chardev"),
            [
                "spiceport,name=org.spice-space.webdav.0,id=charchannel1",
                "spicevmc,id=vdagent,debug=0,name=vdagent",
            ]
        );
        assert!(args.contains(&"virtio-serial-pci".to_string()));
    }

    #[test]
    fn test_virtfs() {
        let mut cfg = bare(Architecture::M68k, Target::Q800);
        cfg.sharing.directory_share_mode = ShareMode::Virtfs;
        cfg.sharing.directory_share_path = Some(PathBuf::from("/srv/share"));
        cfg.sharing.is_directory_share_read_only = true;
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-fsdev"),
            ["local,id=virtfs0,path=/srv/share,security_model=mapped-xattr,readonly=on"]
        );
        assert_eq!(
            window(&args, "-device"),
            ["virtio-9p-device,fsdev=virtfs0,mount_tag=share"]
        );

        let mut sparc = bare(Architecture::Sparc, Target::Ss5);
        sparc.sharing = cfg.sharing.clone();
        assert!(matches!(
            compiler().compile(&sparc),
            Err(CompileError::VirtfsUnsupported { .. })
        ));
    }

    #[test]
    fn test_usb_controller_and_attachments() {
        let mut cfg = bare(Architecture::Aarch64, Target::Virt);
        cfg.input.usb_bus_support = UsbBus::Usb3;
        cfg.drives.push(DriveConfig {
            image_path: None,
            image_type: ImageType::Cd,
            interface: DriveInterface::Usb,
            is_external: true,
            is_read_only: true,
        });
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-device"),
            [
                "qemu-xhci,id=usb-bus",
                "usb-tablet,bus=usb-bus.0",
                "usb-mouse,bus=usb-bus.0",
                "usb-kbd,bus=usb-bus.0",
                "usb-storage,drive=drive0,bus=usb-bus.0,removable=on",
            ]
        );

        cfg.input.usb_bus_support = UsbBus::Disabled;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::UsbBusRequired { .. })
        ));
    }

    #[test]
    fn test_usb_redirection_channels() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        cfg.displays.push(DisplayConfig::new(DisplayDevice::VirtioVga));
        cfg.input.usb_bus_support = UsbBus::Usb2;
        cfg.input.has_usb_sharing = true;
        cfg.input.maximum_usb_share = 2;
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-chardev"),
            [
                "spicevmc,name=usbredir,id=usbredirchardev0",
                "spicevmc,name=usbredir,id=usbredirchardev1",
            ]
        );
    }

    #[test]
    fn test_tweaks_in_order() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        cfg.qemu = QemuTweaks {
            has_uefi_boot: true,
            has_rng_device: true,
            has_hypervisor: true,
            has_balloon_device: true,
            has_tpm_device: true,
            has_rtc_local_time: true,
            has_debug_log: true,
        };
        let args = compiler().compile(&cfg).unwrap();
        let start = args.iter().position(|a| a == "-nic").unwrap() + 2;
        assert_eq!(
            &args[start..],
            [
                "-drive",
                "if=pflash,format=raw,unit=0,readonly=on,file=/fw/edk2-x86_64-code.fd",
                "-device",
                "virtio-rng-pci",
                "-accel",
                "kvm",
                "-device",
                "virtio-balloon-pci",
                "-chardev",
                "socket,id=chrtpm,path=/vms/test.qvm/swtpm.sock",
                "-tpmdev",
                "emulator,id=tpm0,chardev=chrtpm",
                "-device",
                "tpm-tis,tpmdev=tpm0",
                "-rtc",
                "base=localtime",
                "-d",
                "guest_errors,unimp",
                "-D",
                "/vms/test.qvm/debug.log",
            ]
        );
    }

    #[test]
    fn test_tweaks_without_backing() {
        let mut cfg = bare(Architecture::M68k, Target::Q800);
        cfg.qemu.has_uefi_boot = true;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::UefiUnsupported { .. })
        ));
        cfg.qemu.has_uefi_boot = false;
        cfg.qemu.has_tpm_device = true;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::TpmUnsupported { .. })
        ));
    }

    #[test]
    fn test_efi_vars_only_with_uefi_boot() {
        let mut cfg = bare(Architecture::X86_64, Target::Q35);
        cfg.drives.push(DriveConfig {
            image_path: Some(PathBuf::from("efi_vars.fd")),
            image_type: ImageType::EfiVars,
            interface: DriveInterface::Pflash,
            is_external: false,
            is_read_only: false,
        });
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::EfiVarsWithoutUefi { index: 0 })
        ));

        cfg.qemu.has_uefi_boot = true;
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(
            window(&args, "-drive"),
            [
                "if=pflash,format=raw,unit=1,id=drive0,file=/vms/test.qvm/efi_vars.fd",
                "if=pflash,format=raw,unit=0,readonly=on,file=/fw/edk2-x86_64-code.fd",
            ]
        );
    }

    #[test]
    fn test_usb_controller_needs_pci() {
        let mut cfg = bare(Architecture::I386, Target::Isapc);
        cfg.input.usb_bus_support = UsbBus::Usb3;
        assert!(matches!(
            compiler().compile(&cfg),
            Err(CompileError::UsbControllerUnsupported { target: Target::Isapc })
        ));
        cfg.input.usb_bus_support = UsbBus::Disabled;
        assert!(compiler().compile(&cfg).is_ok());
    }

    #[test]
    fn test_s390x_uses_ccw_devices() {
        let mut cfg = bare(Architecture::S390x, Target::S390CcwVirtio);
        cfg.qemu.has_rng_device = true;
        let args = compiler().compile(&cfg).unwrap();
        assert_eq!(window(&args, "-device"), ["virtio-rng-ccw"]);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let cfg = Configuration::with_defaults("same", Architecture::X86_64, Target::Q35);
        assert_eq!(compiler().compile(&cfg).unwrap(), compiler().compile(&cfg).unwrap());
    }
}
