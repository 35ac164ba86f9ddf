//! Workspace-scoped advisory file locks.
//!
//! A phase execution holds its workspace's lock exclusively, a metrics
//! sample holds it shared, and destroy probes it without blocking so a
//! busy workspace fails fast. Promotion serializes on a per-run lock.
//! Locks release when the guard drops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::RelayError;

#[derive(Debug)]
pub struct LockGuard {
    _file: File,
}

fn open_lock_file(path: &Path) -> Result<File, RelayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RelayError::io(parent, source))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| RelayError::io(path, source))
}

/// Block until the exclusive lock is held.
pub fn lock_exclusive(path: &Path) -> Result<LockGuard, RelayError> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()
        .map_err(|source| RelayError::io(path, source))?;
    Ok(LockGuard { _file: file })
}

/// Exclusive lock acquired off the async runtime, since flock waits are
/// blocking.
pub async fn lock_exclusive_async(path: PathBuf) -> Result<LockGuard, RelayError> {
    let target = path.clone();
    tokio::task::spawn_blocking(move || lock_exclusive(&target))
        .await
        .map_err(|err| RelayError::io(&path, std::io::Error::other(err)))?
}

/// Non-blocking shared probe. Ok(None) when an exclusive holder has it.
pub fn try_lock_shared(path: &Path) -> Result<Option<LockGuard>, RelayError> {
    let file = open_lock_file(path)?;
    // Via the trait: File grew an inherent try_lock_shared in Rust 1.89
    // with a different error type.
    match FileExt::try_lock_shared(&file) {
        Ok(()) => Ok(Some(LockGuard { _file: file })),
        Err(err) if is_contention(&err) => Ok(None),
        Err(source) => Err(RelayError::io(path, source)),
    }
}

/// Non-blocking exclusive probe. Ok(None) when any holder has it.
pub fn try_lock_exclusive(path: &Path) -> Result<Option<LockGuard>, RelayError> {
    let file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockGuard { _file: file })),
        Err(err) if is_contention(&err) => Ok(None),
        Err(source) => Err(RelayError::io(path, source)),
    }
}

fn is_contention(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
