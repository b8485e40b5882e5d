//! Single-writer lock around a deployment cycle.

use crate::utils::errors::{DeployError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = ".deploy.lock";

/// Exclusive advisory lock held for the duration of one cycle.
///
/// Released when dropped. The lock file itself is left in place.
#[derive(Debug)]
pub struct CycleLock {
    file: File,
    path: PathBuf,
}

impl CycleLock {
    /// Lock file used for a given baseline: a sibling named `.deploy.lock`.
    pub fn path_for(baseline: &Path) -> PathBuf {
        match baseline.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(LOCK_FILE_NAME),
            _ => PathBuf::from(LOCK_FILE_NAME),
        }
    }

    /// Take the lock without waiting; a held lock is `CycleInProgress`.
    ///
    /// The parent directory must already exist.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(DeployError::CycleInProgress(path));
        }

        debug!(path = %path.display(), "Acquired cycle lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "Failed to release cycle lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(LOCK_FILE_NAME);

        let held = CycleLock::acquire(&path).unwrap();
        let err = CycleLock::acquire(&path).unwrap_err();
        assert!(matches!(err, DeployError::CycleInProgress(p) if p == path));

        drop(held);
        assert!(CycleLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_sits_next_to_baseline() {
        assert_eq!(
            CycleLock::path_for(Path::new("/srv/site/.sync_manifest.json")),
            PathBuf::from("/srv/site/.deploy.lock")
        );
        assert_eq!(CycleLock::path_for(Path::new("manifest.json")), PathBuf::from(".deploy.lock"));
    }
}
