/// Exclusive lock over a backup directory
///
/// The lock is a file created with `create_new`, so only one process can hold
/// it. It records the holder's pid and start time and is removed on drop.

use chrono::{SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{BackupError, BackupResult};
use crate::utils::LOCK_FILE_NAME;

#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    /// Take the lock for `dir`, creating the directory if needed
    pub fn acquire(dir: &Path) -> BackupResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| BackupError::io(format!("Failed to create backup directory {}", dir.display()), e))?;

        let path = dir.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown process".to_string());
                return Err(BackupError::Locked { path, holder });
            }
            Err(e) => return Err(BackupError::io(format!("Failed to create lock {}", path.display()), e)),
        };

        let holder = format!(
            "pid {} since {}",
            std::process::id(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if let Err(e) = file.write_all(holder.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(BackupError::io(format!("Failed to write lock {}", path.display()), e));
        }

        tracing::debug!(lock = %path.display(), "acquired directory lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to release directory lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_locked() {
        let dir = tempdir().unwrap();
        let held = DirectoryLock::acquire(dir.path()).unwrap();

        match DirectoryLock::acquire(dir.path()) {
            Err(BackupError::Locked { holder, .. }) => {
                assert!(holder.contains(&format!("pid {}", std::process::id())))
            }
            other => panic!("expected lock contention, got {:?}", other),
        }

        drop(held);
        assert!(DirectoryLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_lock_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = {
            let lock = DirectoryLock::acquire(&dir.path().join("nested")).unwrap();
            assert!(lock.path().exists());
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
