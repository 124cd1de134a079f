//! Shell completion utilities

use crate::cli::commands::Cli;
use crate::Result;
use anyhow::{anyhow, Context};
use clap::CommandFactory;
use clap_complete::{generate, Generator, Shell};
use std::fs::{self, File};
use std::path::PathBuf;

/// Generate shell completions
pub fn print_completions<G: Generator>(gen: G, cmd: &mut clap::Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut std::io::stdout());
}

/// Fish completion directory, honouring `XDG_CONFIG_HOME`
fn fish_completion_dir() -> Result<PathBuf> {
    let config = match std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .join(".config"),
    };
    Ok(config.join("fish").join("completions"))
}

/// Install Fish completions automatically
pub fn install_fish_completions() -> Result<()> {
    let fish_dir = fish_completion_dir()?;
    fs::create_dir_all(&fish_dir).with_context(|| format!("creating {}", fish_dir.display()))?;

    let completion_file = fish_dir.join("qvmm.fish");
    let mut cmd = Cli::command();
    let mut file = File::create(&completion_file)?;

    generate(Shell::Fish, &mut cmd, "qvmm", &mut file);

    println!("Fish completions installed to: {}", completion_file.display());
    Ok(())
}

/// Generate man page
pub fn generate_man_page() -> Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buffer: Vec<u8> = Vec::new();
    man.render(&mut buffer)?;

    print!("{}", String::from_utf8(buffer)?);
    Ok(())
}
