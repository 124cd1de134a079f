use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser};
use qvmm::cli::commands::{Cli, Cmd};
use qvmm::cli::completions::{generate_man_page, install_fish_completions, print_completions};
use qvmm::config::constants::{NetworkMode, ShareMode};
use qvmm::config::defaults::{derive_display, derive_network, DEFAULT_SHARE_DIR};
use qvmm::config::schema::{Configuration, DisplayFrontend, Spice, Vnc};
use qvmm::utils::paths::{pid_path, resolve_under_root};
use qvmm::utils::system::{pick_qemu_bin, running_pid, terminate_pid};
use qvmm::vm::creator::{drop_spice_features, CreateParams, DisplayMode, VmCreator};
use qvmm::vm::supervisor::{OutputStream, StartOutcome, SupervisorEvent};
use qvmm::{logging, Error, Settings, VmManager};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

/// ---- main ----
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // Commands that never touch the data home.
    match &cli.cmd {
        Cmd::Completions { shell } => {
            print_completions(*shell, &mut Cli::command());
            return Ok(());
        }
        Cmd::InstallFish => return install_fish_completions(),
        Cmd::ManPage => return generate_man_page(),
        _ => {}
    }

    let settings = Settings::resolve(cli.data_home, cli.qemu_prefix)?;
    let (mgr, _report) = VmManager::open(settings)?;

    match cli.cmd {
        Cmd::Create {
            name,
            arch,
            target,
            cpu_model,
            cpus,
            mem,
            net_mode,
            bridge_if,
            display_mode,
            disk,
            disk_size,
            cdrom,
            uefi,
            hypervisor,
            share,
        } => {
            let params = CreateParams {
                name,
                arch,
                target,
                mem,
                cpus,
                cpu_model,
                disk,
                disk_size,
                cdrom,
                net_mode,
                bridge_if,
                display_mode,
                uefi,
                hypervisor,
                share,
            };
            VmCreator::create_vm(&mgr, params).await?;
        }

        Cmd::List => list_vms(&mgr)?,

        Cmd::Show { name } => {
            let cfg = mgr.find(&name)?;
            println!("{}", cfg.to_json()?);
        }

        Cmd::Args { name } => {
            let cfg = mgr.find(&name)?;
            let args = mgr.compiler(&cfg)?.compile(&cfg)?;
            let binary = pick_qemu_bin(mgr.settings().qemu_prefix.as_deref(), cfg.architecture())
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| cfg.architecture().qemu_binary());
            let line: Vec<String> = std::iter::once(binary).chain(args).map(|a| shell_quote(&a)).collect();
            println!("{}", line.join(" "));
        }

        Cmd::Start { name } => start_vm(&mgr, &name).await?,

        Cmd::Stop { name } => {
            let cfg = mgr.find(&name)?;
            let vm_dir = mgr.bundle_dir(cfg.id())?;
            let pid = running_pid(&vm_dir).ok_or_else(|| anyhow!("VM '{}' is not running", name))?;
            terminate_pid(pid).with_context(|| format!("failed to signal pid {pid}"))?;
            println!("Sent shutdown to VM '{}' (pid {})", name, pid);
        }

        Cmd::Delete { name, force } => delete_vm(&mgr, &name, force).await?,

        Cmd::SetDisplay {
            name,
            mode,
            vnc_unix,
            vnc_host,
            vnc_display,
            vnc_sock,
            spice_unix,
            spice_addr,
            spice_port,
            spice_sock,
            spice_disable_ticketing,
        } => {
            let mut cfg = mgr.find(&name)?;
            if mode == DisplayMode::Headless {
                cfg.displays.clear();
            } else {
                if cfg.displays.is_empty() {
                    let display = derive_display(cfg.system.architecture, cfg.system.target)
                        .ok_or_else(|| anyhow!("{} has no display device", cfg.architecture()))?;
                    cfg.displays.push(display);
                }
                let current = cfg.displays[0].frontend.clone();
                let frontend = match mode {
                    DisplayMode::Gtk => DisplayFrontend::Gtk,
                    DisplayMode::Sdl => DisplayFrontend::Sdl,
                    DisplayMode::Vnc => {
                        let mut vnc = match current {
                            DisplayFrontend::Vnc(v) => v,
                            _ => Vnc::default(),
                        };
                        vnc.use_unix |= vnc_unix;
                        if let Some(h) = vnc_host {
                            vnc.host = h;
                        }
                        if let Some(d) = vnc_display {
                            vnc.display = d;
                        }
                        if let Some(s) = vnc_sock {
                            vnc.sock = s;
                        }
                        DisplayFrontend::Vnc(vnc)
                    }
                    DisplayMode::Spice => {
                        let mut spice = match current {
                            DisplayFrontend::Spice(s) => s,
                            _ => Spice::default(),
                        };
                        spice.use_unix |= spice_unix;
                        if let Some(a) = spice_addr {
                            spice.addr = a;
                        }
                        if let Some(p) = spice_port {
                            spice.port = p;
                        }
                        if let Some(s) = spice_sock {
                            spice.sock = s;
                        }
                        if let Some(t) = spice_disable_ticketing {
                            spice.disable_ticketing = t;
                        }
                        DisplayFrontend::Spice(spice)
                    }
                    DisplayMode::Headless => unreachable!("handled above"),
                };
                cfg.displays[0].frontend = frontend;
            }
            if drop_spice_features(&mut cfg) {
                eprintln!("Note: WebDAV sharing, clipboard and USB sharing need SPICE and were turned off");
            }
            save(&mgr, cfg)?;
        }

        Cmd::SetNetwork {
            name,
            mode,
            bridge_if,
            hardware,
            isolate,
            forwards,
        } => {
            let mut cfg = mgr.find(&name)?;
            if cfg.networks.is_empty() {
                if mode == NetworkMode::None {
                    println!("VM '{}' has no network", name);
                    return Ok(());
                }
                let net = derive_network(cfg.system.architecture, cfg.system.target)
                    .ok_or_else(|| anyhow!("{} has no network device", cfg.architecture()))?;
                cfg.networks.push(net);
            }
            let net = &mut cfg.networks[0];
            net.mode = mode;
            if let Some(br) = bridge_if {
                net.bridge_interface = Some(br);
            }
            if let Some(hw) = hardware {
                net.hardware = hw;
            }
            if let Some(iso) = isolate {
                net.is_isolate_from_host = iso;
            }
            if !forwards.is_empty() {
                net.port_forwards = forwards;
            }
            save(&mgr, cfg)?;
        }

        Cmd::SetShare {
            name,
            mode,
            path,
            read_only,
            clipboard,
        } => {
            let mut cfg = mgr.find(&name)?;
            if mode == ShareMode::Virtfs && cfg.architecture().virtfs_device().is_none() {
                bail!("{} cannot share directories over virtfs", cfg.architecture());
            }
            let sharing = &mut cfg.sharing;
            sharing.directory_share_mode = mode;
            if let Some(p) = path {
                sharing.directory_share_path = Some(p);
            }
            if mode != ShareMode::None && sharing.directory_share_path.is_none() {
                sharing.directory_share_path = Some(PathBuf::from(DEFAULT_SHARE_DIR));
            }
            if let Some(ro) = read_only {
                sharing.is_directory_share_read_only = ro;
            }
            if let Some(cb) = clipboard {
                sharing.has_clipboard_sharing = cb;
            }
            if sharing.directory_share_path.as_deref() == Some(std::path::Path::new(DEFAULT_SHARE_DIR)) {
                let shared = mgr.bundle_dir(cfg.id())?.join(DEFAULT_SHARE_DIR);
                fs::create_dir_all(&shared)?;
            }
            save(&mgr, cfg)?;
        }

        Cmd::Completions { .. } | Cmd::InstallFish | Cmd::ManPage => unreachable!("handled above"),
    }

    Ok(())
}

fn save(mgr: &VmManager, cfg: Configuration) -> Result<()> {
    let name = cfg.name().to_string();
    mgr.save(cfg)?;
    println!("Updated VM '{}'", name);
    Ok(())
}

fn list_vms(mgr: &VmManager) -> Result<()> {
    let vms = mgr.list();
    if vms.is_empty() {
        println!("No VMs found in {}", mgr.settings().data_home.display());
        return Ok(());
    }
    println!("{:<24} {:<8} {:<16} {:>8}  STATUS", "NAME", "ARCH", "TARGET", "MEMORY");
    for cfg in vms {
        let status = match mgr.bundle_dir(cfg.id()).ok().and_then(|d| running_pid(&d)) {
            Some(pid) => format!("running (pid {pid})"),
            None => "stopped".to_string(),
        };
        println!(
            "{:<24} {:<8} {:<16} {:>6}MB  {}",
            cfg.name(),
            cfg.system.architecture,
            cfg.system.target,
            cfg.system.memory_size,
            status
        );
    }
    Ok(())
}

/// Run QEMU in the foreground until it exits; Ctrl-C asks it to shut down.
async fn start_vm(mgr: &VmManager, name: &str) -> Result<()> {
    let cfg = mgr.find(name)?;
    let id = cfg.id();
    let vm_dir = mgr.bundle_dir(id)?;
    if let Some(pid) = running_pid(&vm_dir) {
        bail!("VM '{}' is already running (pid {})", name, pid);
    }

    let mut events = mgr.supervisor().subscribe();
    let pid = match mgr.start(id).await? {
        StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => pid,
    };
    let pid_file = pid_path(&vm_dir);
    fs::write(&pid_file, pid.to_string()).with_context(|| format!("writing {}", pid_file.display()))?;
    println!("Started VM '{}' (pid {})", name, pid);

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Shutting down VM '{}'...", name);
                mgr.stop(id).await;
            }
            event = events.recv() => match event {
                Ok(SupervisorEvent::Output { id: from, stream: OutputStream::Stdout, line }) if from == id => {
                    println!("{line}");
                }
                Ok(SupervisorEvent::Exited { id: from, code }) if from == id => break code,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            },
        }
    };

    let _ = fs::remove_file(&pid_file);
    match code {
        Some(0) => println!("VM '{}' exited", name),
        Some(c) => println!("VM '{}' exited with status {}", name, c),
        None => println!("VM '{}' was terminated", name),
    }
    Ok(())
}

/// Delete a VM by name
async fn delete_vm(mgr: &VmManager, name: &str, force: bool) -> Result<()> {
    let cfg = mgr.find(name)?;
    let vm_dir = mgr.bundle_dir(cfg.id())?;

    if !force {
        println!("About to delete VM '{}':", name);
        println!("  VM Directory: {}", vm_dir.display());
        for drive in cfg.drives.iter().filter(|d| !d.is_external) {
            if let Some(image) = &drive.image_path {
                println!("  {}: {}", drive.image_type, resolve_under_root(&vm_dir, image).display());
            }
        }
        println!();
        print!("Are you sure you want to delete this VM? [y/N]: ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Deletion cancelled.");
            return Ok(());
        }
    }

    match mgr.remove(cfg.id()).await {
        Ok(_) => {}
        Err(Error::StillRunning { .. }) => bail!(
            "Cannot delete VM '{}': VM is currently running. Stop it first with 'qvmm stop {}'",
            name,
            name
        ),
        Err(e) => return Err(e.into()),
    }

    println!("Successfully deleted VM '{}'", name);
    Ok(())
}

/// Quote a token for copy-pasting into a POSIX shell
fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@+%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
