//! JSON hook configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs_err as fs;
use serde::Deserialize;

/// A hook library to make available to the target.
#[derive(Debug, Clone, Deserialize)]
pub struct DylibSpec {
    /// Identifier the `hooks` entries refer to.
    pub name: String,
    /// Built dylib on disk.
    pub path: PathBuf,
    /// Path embedded in the injected `LC_LOAD_DYLIB`.
    pub install_name: String,
}

/// A single symbol redirection.
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    /// Imported symbol exactly as the bind stream spells it, e.g. `_strlen`.
    pub symbol: String,
    /// `name` of the configured dylib providing the replacement.
    pub dylib_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Mach-O executable to patch.
    pub target: PathBuf,
    #[serde(default)]
    pub dylibs: Vec<DylibSpec>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// On-disk wrapper: everything lives under a single `config` key.
#[derive(Deserialize)]
struct ConfigFile {
    config: Config,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn read(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        let ConfigFile { mut config } = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse '{}'", path.display()))?;

        config.target = std::path::absolute(&config.target)?;
        for dylib in &mut config.dylibs {
            dylib.path = std::path::absolute(&dylib.path)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn dylib_by_name(&self, name: &str) -> Option<&DylibSpec> {
        self.dylibs.iter().find(|dylib| dylib.name == name)
    }

    fn validate(&self) -> Result<()> {
        if !self.target.exists() {
            bail!("target '{}' does not exist", self.target.display());
        }
        for dylib in &self.dylibs {
            if !dylib.path.exists() {
                bail!("dylib '{}' does not exist", dylib.path.display());
            }
            // @rpath and @loader_path cannot be resolved to a unique install
            // location at patch time.
            if dylib.install_name.contains("@rpath") {
                bail!("install_name '{}' uses @rpath", dylib.install_name);
            }
            if dylib.install_name.contains("@loader_path") {
                bail!("install_name '{}' uses @loader_path", dylib.install_name);
            }
            if dylib
                .install_name
                .find("@executable_path")
                .is_some_and(|at| at > 0)
            {
                bail!(
                    "@executable_path must lead install_name '{}'",
                    dylib.install_name
                );
            }
        }
        for hook in &self.hooks {
            if self.dylib_by_name(&hook.dylib_name).is_none() {
                bail!(
                    "hook '{}' references unknown dylib '{}'",
                    hook.symbol,
                    hook.dylib_name
                );
            }
        }
        Ok(())
    }
}
