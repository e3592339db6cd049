/// Age-based retention over a backup directory
///
/// Each expired artifact is removed together with its sidecar; the sidecar
/// goes first so an interrupted sweep never leaves a sidecar without its
/// artifact. Individual failures are logged and reported, not fatal.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::core::catalog;
use crate::core::error::BackupResult;
use crate::core::metadata::sidecar_path;
use crate::utils::DEFAULT_RETENTION_DAYS;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl RetentionPolicy {
    pub fn new(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days as u64 * SECS_PER_DAY)
    }

    /// Whether a file last modified at `modified` is past retention at `now`
    pub fn is_expired(&self, modified: SystemTime, now: SystemTime) -> bool {
        // A modification time in the future counts as age zero
        now.duration_since(modified)
            .map(|age| age > self.max_age())
            .unwrap_or(false)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_DAYS)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub directory: PathBuf,
    pub dry_run: bool,
    pub deleted: Vec<PathBuf>,
    pub deleted_count: usize,
    pub bytes_freed: u64,
    pub orphans_removed: Vec<PathBuf>,
    pub failures: Vec<SweepFailure>,
    pub kept: usize,
}

impl SweepReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct RetentionManager;

impl RetentionManager {
    pub fn new() -> Self {
        Self
    }

    pub fn sweep(&self, directory: &Path, policy: &RetentionPolicy) -> BackupResult<SweepReport> {
        self.sweep_at(directory, policy, SystemTime::now(), false)
    }

    /// Sweep each directory in turn; one that cannot be read does not stop the rest
    pub fn sweep_each(
        &self,
        directories: &[PathBuf],
        policy: &RetentionPolicy,
        now: SystemTime,
        dry_run: bool,
    ) -> Vec<(PathBuf, BackupResult<SweepReport>)> {
        directories
            .iter()
            .map(|dir| {
                let outcome = self.sweep_at(dir, policy, now, dry_run);
                if let Err(e) = &outcome {
                    tracing::warn!(directory = %dir.display(), error = %e, "retention sweep failed");
                }
                (dir.clone(), outcome)
            })
            .collect()
    }

    /// Sweep `directory` as of `now`; with `dry_run` nothing is removed
    pub fn sweep_at(
        &self,
        directory: &Path,
        policy: &RetentionPolicy,
        now: SystemTime,
        dry_run: bool,
    ) -> BackupResult<SweepReport> {
        let mut report = SweepReport {
            directory: directory.to_path_buf(),
            dry_run,
            ..Default::default()
        };

        for artifact in catalog::scan(directory)? {
            if !policy.is_expired(artifact.modified, now) {
                report.kept += 1;
                continue;
            }

            if dry_run {
                report.deleted_count += 1;
                report.bytes_freed += artifact.size_bytes;
                report.deleted.push(artifact.path);
                continue;
            }

            match remove_pair(&artifact.path) {
                Ok(()) => {
                    tracing::info!(artifact = %artifact.path.display(), size_bytes = artifact.size_bytes, "removed expired backup");
                    report.deleted_count += 1;
                    report.bytes_freed += artifact.size_bytes;
                    report.deleted.push(artifact.path);
                }
                Err((path, e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove expired backup");
                    report.failures.push(SweepFailure {
                        path,
                        error: e.to_string(),
                    });
                    report.kept += 1;
                }
            }
        }

        for orphan in catalog::orphan_sidecars(directory)? {
            if dry_run {
                report.orphans_removed.push(orphan);
                continue;
            }
            match remove_if_present(&orphan) {
                Ok(()) => {
                    tracing::info!(sidecar = %orphan.display(), "removed orphaned sidecar");
                    report.orphans_removed.push(orphan);
                }
                Err(e) => {
                    tracing::warn!(path = %orphan.display(), error = %e, "Failed to remove orphaned sidecar");
                    report.failures.push(SweepFailure {
                        path: orphan,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.is_partial() {
            tracing::warn!(
                directory = %directory.display(),
                failures = report.failures.len(),
                "retention sweep completed partially"
            );
        }

        Ok(report)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove the sidecar, then the artifact
fn remove_pair(artifact: &Path) -> Result<(), (PathBuf, io::Error)> {
    let sidecar = sidecar_path(artifact);
    remove_if_present(&sidecar).map_err(|e| (sidecar, e))?;
    remove_if_present(artifact).map_err(|e| (artifact.to_path_buf(), e))
}
