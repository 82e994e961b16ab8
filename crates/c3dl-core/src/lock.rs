//! Cross-process exclusion for one collection root.
//!
//! The lock is an OS advisory lock on `<root>/.c3dl.lock`, so it disappears
//! with the process that holds it and a crash can never leave a stale lock.
//! The file itself stays on disk and records the last holder for diagnostics.

use crate::config::CollectionConfig;
use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Guard for exclusive access to a collection root. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock or fail with [`SyncError::AlreadyRunning`] without waiting.
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| SyncError::io_with_path(e, root))?;
        let path = root.join(CollectionConfig::LOCK_FILE_NAME);

        // No truncate: the current holder's record must survive a failed attempt.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SyncError::io_with_path(e, &path))?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if is_contended(&e) {
                let holder = read_holder(&mut file);
                warn!("{} is locked by {}", root.display(), holder);
                return Err(SyncError::AlreadyRunning {
                    root: root.to_path_buf(),
                    holder,
                });
            }
            return Err(SyncError::io_with_path(e, &path));
        }

        write_holder(&mut file).map_err(|e| SyncError::io_with_path(e, &path))?;
        info!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) => warn!("Failed to release lock {}: {}", self.path.display(), e),
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_holder(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(
        file,
        "pid {} since {}",
        std::process::id(),
        chrono::Local::now().to_rfc3339()
    )?;
    file.flush()
}

fn read_holder(file: &mut File) -> String {
    let mut contents = String::new();
    let holder = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut contents))
        .map(|_| contents.trim().to_string());
    match holder {
        Ok(holder) if !holder.is_empty() => holder,
        _ => "an unknown process".to_string(),
    }
}
