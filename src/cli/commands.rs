//! CLI command definitions

use crate::config::constants::{Architecture, NetworkDevice, NetworkMode, Protocol, ShareMode, Target};
use crate::config::schema::PortForward;
use crate::vm::creator::DisplayMode;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// QVMM CLI (Rust)
#[derive(Parser, Debug)]
#[command(name = "qvmm", version, about = "QEMU VM manager in Rust")]
pub struct Cli {
    /// Directory holding VM bundles
    #[arg(long, global = true, env = "QVMM_HOME")]
    pub data_home: Option<PathBuf>,

    /// Directory containing qemu-system-* (defaults to searching PATH)
    #[arg(long, global = true, env = "QVMM_QEMU_PREFIX")]
    pub qemu_prefix: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a new VM (writes vm.json; can create qcow2 disk)
    Create {
        name: String,

        /// Guest architecture (i386, x86_64, arm, aarch64, m68k, ppc, ppc64, riscv64, sparc, s390x)
        #[arg(long, default_value = "aarch64")]
        arch: Architecture,

        /// Machine type (defaults to the architecture's preferred one)
        #[arg(long)]
        target: Option<Target>,

        /// CPU model passed to -cpu (e.g., host, qemu64, max, …)
        #[arg(long)]
        cpu_model: Option<String>,

        /// vCPU count (0 lets QEMU decide)
        #[arg(long)]
        cpus: Option<u16>,

        /// Memory (MB), defaults per architecture
        #[arg(long)]
        mem: Option<u32>,

        /// Network mode (emulated|bridged|none)
        #[arg(long, default_value = "emulated")]
        net_mode: NetworkMode,

        /// Bridge interface (when bridged)
        #[arg(long)]
        bridge_if: Option<String>,

        /// Display mode
        #[arg(long, value_enum, default_value = "spice")]
        display_mode: DisplayMode,

        // Disk options
        /// Disk path (qcow2). If relative, it's under the VM root.
        #[arg(long)]
        disk: Option<PathBuf>,

        /// Create qcow2 disk if absent (e.g., 64G, 100G)
        #[arg(long)]
        disk_size: Option<String>,

        /// ISO to insert into the removable CD drive
        #[arg(long)]
        cdrom: Option<PathBuf>,

        /// Boot with UEFI firmware (copies a fresh variable store into the bundle)
        #[arg(long)]
        uefi: bool,

        /// Use KVM acceleration
        #[arg(long)]
        hypervisor: bool,

        /// Host directory to share with the guest
        #[arg(long)]
        share: Option<PathBuf>,
    },

    /// List VMs
    List,

    /// Print a VM's configuration as JSON
    Show { name: String },

    /// Print the QEMU command line for a VM without starting it
    Args { name: String },

    /// Start a VM in the foreground; Ctrl-C shuts it down
    Start { name: String },

    /// Stop a VM (reads vm.pid and sends SIGTERM)
    Stop { name: String },

    /// Delete a VM and its associated files
    Delete {
        name: String,
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Persist display settings in vm.json
    SetDisplay {
        name: String,
        #[arg(value_enum)]
        mode: DisplayMode,

        // VNC
        #[arg(long)]
        vnc_unix: bool,
        #[arg(long)]
        vnc_host: Option<String>,
        #[arg(long)]
        vnc_display: Option<u8>,
        #[arg(long)]
        vnc_sock: Option<PathBuf>,

        // SPICE
        #[arg(long)]
        spice_unix: bool,
        #[arg(long)]
        spice_addr: Option<String>,
        #[arg(long)]
        spice_port: Option<u16>,
        #[arg(long)]
        spice_sock: Option<PathBuf>,
        #[arg(long)]
        spice_disable_ticketing: Option<bool>,
    },

    /// Persist network settings for the first card in vm.json
    SetNetwork {
        name: String,
        /// emulated|bridged|none
        mode: NetworkMode,
        #[arg(long)]
        bridge_if: Option<String>,
        /// Card model (must exist for the VM's architecture)
        #[arg(long)]
        hardware: Option<NetworkDevice>,
        /// Block guest access to the host (emulated mode)
        #[arg(long)]
        isolate: Option<bool>,
        /// Port forward as proto:host_port:guest_port (repeatable, replaces existing)
        #[arg(long = "forward", value_parser = parse_forward)]
        forwards: Vec<PortForward>,
    },

    /// Persist directory and clipboard sharing in vm.json
    SetShare {
        name: String,
        /// none|webdav|virtfs
        mode: ShareMode,
        /// Shared directory; relative paths live in the bundle
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        read_only: Option<bool>,
        #[arg(long)]
        clipboard: Option<bool>,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Install Fish shell completions automatically
    InstallFish,

    /// Generate man page
    ManPage,
}

/// Parse `proto:host_port:guest_port`
pub fn parse_forward(s: &str) -> Result<PortForward, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [proto, host, guest] = parts.as_slice() else {
        return Err(format!("expected proto:host_port:guest_port, got '{s}'"));
    };
    let protocol: Protocol = proto.parse().map_err(|e| format!("{e}"))?;
    let host_port = host.parse().map_err(|_| format!("invalid host port '{host}'"))?;
    let guest_port = guest.parse().map_err(|_| format!("invalid guest port '{guest}'"))?;
    Ok(PortForward {
        protocol,
        host_address: None,
        host_port,
        guest_address: None,
        guest_port,
    })
}
