/// Error taxonomy for backup, verification, retention and restore operations
///
/// Integrity problems are not errors: they surface as warnings inside a
/// `Verification` so the operator can decide whether to continue. Partial
/// retention sweeps are reported through `SweepReport::failures`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::engine::EngineError;

pub type BackupResult<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("database engine unreachable at {target}: {reason}")]
    Connection { target: String, reason: String },

    #[error("dump of database '{database}' failed: {reason}")]
    DumpFailed { database: String, reason: String },

    #[error("compression of dump for '{database}' failed: {reason}")]
    CompressionFailed { database: String, reason: String },

    #[error("loading into database '{database}' failed during {stage}: {reason}")]
    LoadFailed {
        database: String,
        stage: String,
        reason: String,
        snapshot: Option<PathBuf>,
        target_dropped: bool,
    },

    #[error("operation aborted: confirmation declined at {stage}")]
    ConfirmationDeclined { stage: String },

    #[error("{stage} exceeded its deadline of {}", humantime::format_duration(*after))]
    Timeout { stage: String, after: Duration },

    #[error("backup directory is locked by {holder} ({})", path.display())]
    Locked { path: PathBuf, holder: String },

    #[error("metadata error for {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },

    #[error("sidecar for {} could not be written: {reason}", artifact.display())]
    SidecarWrite { artifact: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid database name '{0}'")]
    InvalidName(String),

    #[error("no backup artifacts found in {}", .0.display())]
    NoArtifacts(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Io {
            context: context.into(),
            source,
        }
    }

    /// Map an engine failure to a connection error for the given target
    pub fn connection(target: impl Into<String>, err: EngineError) -> Self {
        BackupError::Connection {
            target: target.into(),
            reason: err.to_string(),
        }
    }

    /// A clean abort performed before any destructive statement ran
    pub fn is_declined(&self) -> bool {
        matches!(self, BackupError::ConfirmationDeclined { .. })
    }

    /// Precise recovery instructions to print next to the failure reason
    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            BackupError::Connection { .. } => Some(
                "Check DB_HOST/DB_PORT/DB_USER/DB_PASSWORD in the env file and that the server is running; nothing was modified."
                    .to_string(),
            ),
            BackupError::DumpFailed { .. }
            | BackupError::CompressionFailed { .. } => Some(
                "No artifact was written; the partial file was discarded. Re-run after fixing the cause."
                    .to_string(),
            ),
            BackupError::LoadFailed {
                database,
                snapshot,
                target_dropped,
                ..
            } => {
                let state = if *target_dropped {
                    format!("Database '{}' was dropped and may be empty or partially loaded.", database)
                } else {
                    format!("Database '{}' was not dropped.", database)
                };
                Some(match snapshot {
                    Some(path) => format!(
                        "{} Pre-restore snapshot located at {}; restore it manually with `dbvault restore` once the cause is fixed.",
                        state,
                        path.display()
                    ),
                    None => format!("{} No pre-restore snapshot was taken.", state),
                })
            }
            BackupError::SidecarWrite { artifact, .. } => Some(format!(
                "The artifact was discarded with its sidecar, so no backup was kept. Check permissions and free space in {} and retry.",
                artifact.parent().map(|p| p.display().to_string()).unwrap_or_default()
            )),
            BackupError::Timeout { .. } => Some(
                "Temporary files were removed. Raise BACKUP_DEADLINE_SECS (0 disables the deadline) and retry."
                    .to_string(),
            ),
            BackupError::Locked { path, .. } => Some(format!(
                "Wait for the other dbvault process to finish, or remove {} if it is stale.",
                path.display()
            )),
            BackupError::ConfirmationDeclined { .. } => {
                Some("No changes were made to the target database.".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_failure_hint_names_snapshot() {
        let err = BackupError::LoadFailed {
            database: "shipping".to_string(),
            stage: "load".to_string(),
            reason: "disk full".to_string(),
            snapshot: Some(PathBuf::from("/var/backups/shipping_pre_restore_20260101_000000.sql.gz")),
            target_dropped: true,
        };

        let hint = err.recovery_hint().unwrap();
        assert!(hint.contains("/var/backups/shipping_pre_restore_20260101_000000.sql.gz"));
        assert!(hint.contains("dropped"));
    }

    #[test]
    fn test_declined_is_clean() {
        let err = BackupError::ConfirmationDeclined {
            stage: "keyword".to_string(),
        };
        assert!(err.is_declined());
        assert!(err.recovery_hint().unwrap().contains("No changes"));
    }
}
