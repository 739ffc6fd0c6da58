//! Copies hook dylibs to the locations their install names imply, so the
//! injected load commands resolve at launch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use log::info;

use crate::config::Config;

/// Resolve an install name to the on-disk path it implies. A leading
/// `@executable_path` refers to the directory holding the target executable.
pub fn resolve_install_name(install_name: &str, executable_dir: &Path) -> PathBuf {
    match install_name.strip_prefix("@executable_path") {
        Some(rest) => executable_dir.join(rest.trim_start_matches('/')),
        None => PathBuf::from(install_name),
    }
}

/// Copy every configured dylib to its resolved install location, overwriting
/// a stale copy. A dylib already built in place is left alone.
pub fn install_dylibs(config: &Config) -> Result<()> {
    let executable_dir = config.target.parent().unwrap_or(Path::new("."));
    for dylib in &config.dylibs {
        let destination = resolve_install_name(&dylib.install_name, executable_dir);
        if destination == dylib.path {
            continue;
        }
        info!(
            "installing {} -> {}",
            dylib.path.display(),
            destination.display()
        );
        fs::copy(&dylib.path, &destination)
            .with_context(|| format!("failed to install dylib '{}'", dylib.name))?;
    }
    Ok(())
}
