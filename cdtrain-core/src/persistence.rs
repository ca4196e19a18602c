//! Atomic file writes for checkpoints and run artifacts.
//!
//! Every checkpoint slot is written to a `.tmp` sibling and renamed over the
//! target, so a crash mid-write never leaves a truncated checkpoint behind.

use std::io;
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to compact JSON, writes to a `.tmp` sibling file,
/// then renames to the target path. Creates parent directories if needed.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec(data).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically copy `from` over `to`.
///
/// Used to duplicate the latest checkpoint into the best-model slot.
pub fn atomic_copy(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = to.with_extension("tmp");
    std::fs::copy(from, &tmp)?;
    std::fs::rename(&tmp, to)?;
    Ok(())
}
