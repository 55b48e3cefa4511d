//! Durable file operations for templates and the renderer config
//!
//! Writes go through a temporary file in the destination directory that is
//! fsynced and then renamed over the target, so the renderer never observes
//! a half-written template and the content survives a crash right after the
//! call returns.

use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File I/O error with the path it happened on
#[derive(Debug, Error)]
#[error("I/O error on {path}: {source}")]
pub struct IoError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl IoError {
    fn new(path: &Path, source: std::io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `contents` to `path` atomically and durably.
///
/// The parent directory must already exist.
///
/// # Errors
///
/// Returns `IoError` if the temp file cannot be created, written, synced or
/// renamed into place.
pub fn write_durable(path: &Path, contents: &[u8]) -> Result<(), IoError> {
    let dir = parent_dir(path);

    let mut tmp = tempfile::Builder::new()
        .prefix(".mct-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| IoError::new(path, e))?;
    tmp.write_all(contents).map_err(|e| IoError::new(path, e))?;
    tmp.as_file().sync_all().map_err(|e| IoError::new(path, e))?;
    tmp.persist(path).map_err(|e| IoError::new(path, e.error))?;

    sync_dir(dir).map_err(|e| IoError::new(dir, e))?;
    debug!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

/// Delete `path`, propagating every failure including `NotFound`.
pub fn remove_file(path: &Path) -> Result<(), IoError> {
    std::fs::remove_file(path).map_err(|e| IoError::new(path, e))?;
    sync_dir(parent_dir(path)).map_err(|e| IoError::new(path, e))?;
    debug!("Removed {}", path.display());
    Ok(())
}

/// Delete `path` if possible; failures are logged and swallowed.
pub fn remove_file_best_effort(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            true
        }
        Err(e) => {
            debug!("Skipped removing {}: {}", path.display(), e);
            false
        }
    }
}

/// Read a file as UTF-8, treating a missing file as empty.
pub fn read_to_string_or_empty(path: &Path) -> Result<String, IoError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(IoError::new(path, e)),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
