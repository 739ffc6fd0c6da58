use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;
use clap::error::ErrorKind;

use hookbind::{Config, install, patch};

/// Rebind lazy-bound imports of a Mach-O executable to hook dylibs
#[derive(Debug, Parser)]
#[command(name = "hookbind", version)]
struct Cli {
    /// Path to the JSON hook configuration
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let code = match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
            _ => 1,
        };
        let _ = err.print();
        process::exit(code);
    });
    stderrlog::new().verbosity(log::Level::Info).init()?;

    let config = Config::read(&cli.config)?;
    install::install_dylibs(&config)?;
    patch::patch_file(&config)?;
    Ok(())
}
