//! Atomic metadata persistence and the single-writer lock
//!
//! Documents are written to a temp file, synced, then renamed into place so a
//! crash mid-write never replaces a valid file with a partial one. Writers
//! serialize on an exclusively-created lock file that is removed on drop.

use crate::error::RSError;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_FILE: &str = ".repository.lock";
const LOCK_RETRY: Duration = Duration::from_millis(25);

/// Write `bytes` to `path` via a temp-file-then-rename sequence.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RSError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

/// Exclusive advisory lock on a metadata directory, held for the duration of
/// one write. The lock file records the owner's pid for diagnostics and is
/// deleted when the guard drops.
#[derive(Debug)]
pub(crate) struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    /// Take the lock or fail fast with [`RSError::RepositoryLocked`].
    pub fn try_acquire(dir: &Path) -> Result<Self, RSError> {
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut handle) => {
                let _ = write!(handle, "{{\"pid\":{}}}", std::process::id());
                log::debug!("acquired repository lock {}", path.display());
                Ok(RepoLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RSError::RepositoryLocked)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock, blocking until the current holder releases it.
    pub fn acquire(dir: &Path) -> Result<Self, RSError> {
        loop {
            match Self::try_acquire(dir) {
                Err(RSError::RepositoryLocked) => std::thread::sleep(LOCK_RETRY),
                other => return other,
            }
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}
