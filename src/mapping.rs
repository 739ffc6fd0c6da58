//! Shared read-write mapping of the target image.

use std::path::Path;

use fs_err as fs;
use memmap2::MmapMut;

use crate::errors::Result;

/// Map `path` read-write, hand the bytes to `patch`, then flush the mapping
/// back to disk synchronously. The mapping and the file handle are released
/// on success and failure alike; a patch failure wins over a flush failure.
pub fn with_image_mut<T>(path: &Path, patch: impl FnOnce(&mut [u8]) -> Result<T>) -> Result<T> {
    let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
    // Safety: the tool assumes exclusive access to the target for the
    // duration of the run; nothing else truncates or remaps the file.
    let mut image = unsafe { MmapMut::map_mut(file.file())? };
    let outcome = patch(&mut image);
    let flushed = image.flush();
    let value = outcome?;
    flushed?;
    Ok(value)
}
