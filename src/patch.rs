//! Drives the edit: make sure every configured dylib is a load command of
//! the target, then point the matching lazy bindings at it.

use log::{debug, info};

use crate::config::Config;
use crate::errors::{PatchError, Result};
use crate::lazy_bind;
use crate::macho::{self, MachFile};
use crate::mapping;

/// Patch the configured target on disk.
pub fn patch_file(config: &Config) -> Result<()> {
    mapping::with_image_mut(&config.target, |image| patch_image(image, config))
}

/// Apply the configured hooks to a mapped Mach-O image.
///
/// Dylib injection strictly precedes the ordinal lookups and the lazy-bind
/// scan: appending grows `sizeofcmds`, and the ordinal of every later dylib
/// command depends on how many were injected before it.
pub fn patch_image(image: &mut [u8], config: &Config) -> Result<()> {
    let mut mach = MachFile::parse(image)?;

    for dylib in &config.dylibs {
        if mach.dylib_ordinal(&dylib.install_name)?.is_none() {
            info!("injecting LC_LOAD_DYLIB for {}", dylib.install_name);
            let block = macho::build_dylib_command(&dylib.install_name)?;
            mach.append_load_command(&block)?;
        }
    }

    let dyld_info = mach.dyld_info()?;
    let bindings = lazy_bind::scan(mach.bytes(), &dyld_info)?;

    for hook in &config.hooks {
        let install_name = config
            .dylib_by_name(&hook.dylib_name)
            .map(|dylib| dylib.install_name.as_str())
            .ok_or_else(|| PatchError::UnknownHookDylib(hook.dylib_name.clone()))?;
        let ordinal = mach
            .dylib_ordinal(install_name)?
            .ok_or_else(|| PatchError::UnknownHookDylib(hook.dylib_name.clone()))?;

        let mut rewritten = 0usize;
        for binding in &bindings {
            if binding.symbol_name(mach.bytes()) == hook.symbol.as_bytes() {
                binding.set_ordinal(mach.bytes_mut(), ordinal)?;
                rewritten += 1;
            }
        }
        debug!(
            "{}: {rewritten} lazy binding(s) rebound to {install_name} (ordinal {ordinal})",
            hook.symbol
        );
    }

    Ok(())
}
