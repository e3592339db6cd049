/// Artifact enumeration
///
/// Lists compressed artifacts and legacy uncompressed dumps in a backup
/// directory, newest first. Hidden files (temporaries, the lock file) and
/// sidecars are never listed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::archive::{BackupArtifact, CompressionAlgorithm};
use crate::core::error::{BackupError, BackupResult};
use crate::core::metadata::sidecar_path;
use crate::utils::METADATA_SUFFIX;

fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && !name.ends_with(METADATA_SUFFIX)
        && CompressionAlgorithm::from_path(path).is_some()
}

/// All artifacts directly inside `dir`, newest first. A missing directory is empty.
pub fn scan(dir: &Path) -> BackupResult<Vec<BackupArtifact>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::io(format!("Failed to read {}", dir.display()), e)),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io(format!("Failed to read {}", dir.display()), e))?;
        let path = entry.path();
        if !path.is_file() || !is_candidate(&path) {
            continue;
        }

        match BackupArtifact::from_file(&path) {
            Ok(artifact) => artifacts.push(artifact),
            // Removed between listing and stat, e.g. by a concurrent sweep
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(BackupError::io(format!("Failed to stat {}", path.display()), e)),
        }
    }

    artifacts.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(artifacts)
}

/// Sidecars in `dir` whose artifact no longer exists
pub fn orphan_sidecars(dir: &Path) -> BackupResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::io(format!("Failed to read {}", dir.display()), e)),
    };

    let mut orphans = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if let Some(artifact_name) = name.strip_suffix(METADATA_SUFFIX) {
            if !dir.join(artifact_name).exists() {
                orphans.push(path);
            }
        }
    }
    orphans.sort();
    Ok(orphans)
}

/// Whether `artifact` has a sidecar next to it
pub fn has_sidecar(artifact: &Path) -> bool {
    sidecar_path(artifact).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"x").unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
        path
    }

    #[test]
    fn test_scan_orders_newest_first_and_filters() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "shipping_manual_20260101_000000.sql.gz", 300);
        touch(dir.path(), "shipping_manual_20260102_000000.sql.gz", 100);
        touch(dir.path(), "legacy_dump.sql", 200);
        touch(dir.path(), "shipping_manual_20260102_000000.sql.gz.meta", 100);
        touch(dir.path(), ".shipping_manual.abc.partial", 0);
        touch(dir.path(), ".dbvault.lock", 0);
        touch(dir.path(), "notes.txt", 0);
        fs::create_dir(dir.path().join("reset_backups")).unwrap();

        let names: Vec<String> = scan(dir.path()).unwrap().iter().map(|a| a.file_name()).collect();
        assert_eq!(
            names,
            vec![
                "shipping_manual_20260102_000000.sql.gz",
                "legacy_dump.sql",
                "shipping_manual_20260101_000000.sql.gz",
            ]
        );
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(scan(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_orphan_sidecars() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a_manual_20260101_000000.sql.gz", 0);
        touch(dir.path(), "a_manual_20260101_000000.sql.gz.meta", 0);
        let orphan = touch(dir.path(), "b_manual_20260101_000000.sql.gz.meta", 0);

        assert_eq!(orphan_sidecars(dir.path()).unwrap(), vec![orphan]);
        assert!(has_sidecar(&dir.path().join("a_manual_20260101_000000.sql.gz")));
    }
}
