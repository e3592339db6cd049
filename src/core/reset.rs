/// Full reinitialisation of a database
///
/// Same safety rails as a restore: typed confirmation with the `RESET`
/// keyword, then a `pre_reset` snapshot in its own namespace, then drop,
/// recreate and an optional schema load.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::archive::{ArchiveWriter, BackupKind, CompressionAlgorithm};
use crate::core::confirm::{run_gate, Operator};
use crate::core::engine::DatabaseEngine;
use crate::core::error::{BackupError, BackupResult};
use crate::core::restore::{prepare_dump, replace_database, PreparedDump};
use crate::utils::{is_valid_identifier, RESET_KEYWORD};

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub target_database: String,
    pub pre_reset_snapshot: Option<PathBuf>,
    pub schema: Option<PathBuf>,
    pub table_count: u64,
}

pub struct ResetOrchestrator {
    engine: Arc<dyn DatabaseEngine>,
    writer: ArchiveWriter,
    reset_dir: PathBuf,
    target_database: String,
    schema: Option<PathBuf>,
    deadline: Option<Duration>,
}

impl ResetOrchestrator {
    pub fn new(
        engine: Arc<dyn DatabaseEngine>,
        writer: ArchiveWriter,
        reset_dir: impl Into<PathBuf>,
        target_database: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            writer,
            reset_dir: reset_dir.into(),
            target_database: target_database.into(),
            schema: None,
            deadline: None,
        }
    }

    /// SQL file to load into the fresh database (plain or gzip)
    pub fn with_schema(mut self, schema: Option<PathBuf>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn run(&self, operator: &mut dyn Operator) -> BackupResult<ResetReport> {
        let target = self.target_database.as_str();
        if !is_valid_identifier(target) {
            return Err(BackupError::InvalidName(target.to_string()));
        }

        let prepared = match &self.schema {
            Some(schema) => Some(self.prepare_schema(schema)?),
            None => None,
        };

        operator.warn(&format!(
            "Resetting '{}' removes ALL of its data{}",
            target,
            match &self.schema {
                Some(schema) => format!(" and reloads it from {}", schema.display()),
                None => " and leaves it empty".to_string(),
            }
        ));
        let token = run_gate(operator, target, RESET_KEYWORD)?;

        let exists = self
            .engine
            .database_exists(target)
            .await
            .map_err(|e| BackupError::connection(target, e))?;

        let mut snapshot = None;
        if exists {
            match self.writer.create(target, &self.reset_dir, BackupKind::PreReset).await {
                Ok(created) => {
                    tracing::info!(snapshot = %created.artifact.path.display(), "pre-reset snapshot taken");
                    snapshot = Some(created.artifact.path);
                }
                Err(e) => {
                    operator.warn(&format!("Pre-reset snapshot failed: {}", e));
                    if !operator.affirm("Proceed WITHOUT a safety snapshot?") {
                        return Err(BackupError::ConfirmationDeclined {
                            stage: "snapshot failure".to_string(),
                        });
                    }
                    tracing::warn!(target_db = target, error = %e, "continuing without pre-reset snapshot");
                }
            }
        }

        let script = prepared.as_ref().map(|p| p.script());
        replace_database(self.engine.as_ref(), &token, script, snapshot.clone(), self.deadline).await?;

        let table_count = self
            .engine
            .table_count(target)
            .await
            .map_err(|e| BackupError::LoadFailed {
                database: target.to_string(),
                stage: "post-verify".to_string(),
                reason: e.to_string(),
                snapshot: snapshot.clone(),
                target_dropped: true,
            })?;

        tracing::info!(target_db = target, tables = table_count, "database reset");
        Ok(ResetReport {
            target_database: target.to_string(),
            pre_reset_snapshot: snapshot,
            schema: self.schema.clone(),
            table_count,
        })
    }

    fn prepare_schema(&self, schema: &Path) -> BackupResult<SchemaScript> {
        if !schema.is_file() {
            return Err(BackupError::Config(format!(
                "schema file {} does not exist",
                schema.display()
            )));
        }

        match CompressionAlgorithm::from_path(schema) {
            Some(CompressionAlgorithm::Gzip) => {
                std::fs::create_dir_all(&self.reset_dir).map_err(|e| {
                    BackupError::io(format!("Failed to create {}", self.reset_dir.display()), e)
                })?;
                let prepared = prepare_dump(schema, &self.reset_dir, None)
                    .map_err(|e| BackupError::io(format!("Failed to decompress {}", schema.display()), e))?;
                Ok(SchemaScript::Decompressed(prepared))
            }
            _ => Ok(SchemaScript::Plain(schema.to_path_buf())),
        }
    }
}

enum SchemaScript {
    Plain(PathBuf),
    Decompressed(PreparedDump),
}

impl SchemaScript {
    fn script(&self) -> &Path {
        match self {
            SchemaScript::Plain(path) => path,
            SchemaScript::Decompressed(prepared) => prepared.path(),
        }
    }
}
