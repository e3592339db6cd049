/// Restore orchestration
///
/// A restore is an explicit state machine:
///
/// `Selecting → Verifying → ConfirmGate → Snapshotting → Preparing → Loading → PostVerify → Done`
///
/// Any state before `Loading` can move to `Aborted`, which never touches the
/// target database. Destructive statements only run in `Loading`, and they
/// need the `FinalConfirmed` token produced by `ConfirmGate`. A failure once
/// `Loading` has started ends in `Failed` and reports where the pre-restore
/// snapshot lives; it is never restored automatically.

use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

use crate::core::archive::{ArchiveWriter, BackupArtifact, BackupKind, CompressionAlgorithm};
use crate::core::catalog;
use crate::core::confirm::{run_gate, ConfirmationLevel, FinalConfirmed, Operator};
use crate::core::engine::DatabaseEngine;
use crate::core::error::{BackupError, BackupResult};
use crate::core::rewrite::{detect_source_database, NameRewrite};
use crate::core::verify::{IntegrityVerifier, Verification};
use crate::utils::{is_valid_identifier, RESTORE_KEYWORD};

/// Transient description of one restore
#[derive(Debug)]
pub struct RestorePlan {
    pub selected_artifact: BackupArtifact,
    pub target_database: String,
    pub pre_restore_snapshot: Option<BackupArtifact>,
    pub database_name_rewrite: Option<NameRewrite>,
    pub confirmation_level: ConfirmationLevel,
    pub verification: Option<Verification>,
}

impl RestorePlan {
    fn new(selected_artifact: BackupArtifact, target_database: String) -> Self {
        Self {
            selected_artifact,
            target_database,
            pre_restore_snapshot: None,
            database_name_rewrite: None,
            confirmation_level: ConfirmationLevel::Unconfirmed,
            verification: None,
        }
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.pre_restore_snapshot.as_ref().map(|a| a.path.clone())
    }
}

/// Decompressed, possibly renamed, dump ready to be executed.
/// The working file is deleted when this is dropped.
#[derive(Debug)]
pub struct PreparedDump {
    file: NamedTempFile,
    pub bytes: u64,
}

impl PreparedDump {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub artifact: PathBuf,
    pub target_database: String,
    pub pre_restore_snapshot: Option<PathBuf>,
    /// Source database name when the dump was renamed on the way in
    pub renamed_from: Option<String>,
    pub verification: Option<Verification>,
    pub table_count: u64,
    pub stages: Vec<&'static str>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum RestoreStage {
    Selecting,
    Verifying(RestorePlan),
    ConfirmGate(RestorePlan),
    Snapshotting(RestorePlan, FinalConfirmed),
    Preparing(RestorePlan, FinalConfirmed),
    Loading(RestorePlan, FinalConfirmed, PreparedDump),
    PostVerify(RestorePlan),
    Done(RestoreReport),
    Aborted(BackupError),
    Failed(BackupError),
}

impl RestoreStage {
    pub fn name(&self) -> &'static str {
        match self {
            RestoreStage::Selecting => "selecting",
            RestoreStage::Verifying(_) => "verifying",
            RestoreStage::ConfirmGate(_) => "confirm-gate",
            RestoreStage::Snapshotting(..) => "snapshotting",
            RestoreStage::Preparing(..) => "preparing",
            RestoreStage::Loading(..) => "loading",
            RestoreStage::PostVerify(_) => "post-verify",
            RestoreStage::Done(_) => "done",
            RestoreStage::Aborted(_) => "aborted",
            RestoreStage::Failed(_) => "failed",
        }
    }

    /// Whether the target database may have been modified by the time this stage runs
    fn is_destructive(&self) -> bool {
        matches!(self, RestoreStage::Loading(..) | RestoreStage::PostVerify(_))
    }
}

pub struct RestoreOrchestrator {
    engine: Arc<dyn DatabaseEngine>,
    writer: ArchiveWriter,
    verifier: IntegrityVerifier,
    backup_dir: PathBuf,
    target_database: String,
    selection: Option<usize>,
    deadline: Option<Duration>,
}

impl RestoreOrchestrator {
    /// `writer` takes the pre-restore snapshot and must share `engine`
    pub fn new(
        engine: Arc<dyn DatabaseEngine>,
        writer: ArchiveWriter,
        backup_dir: impl Into<PathBuf>,
        target_database: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            writer,
            verifier: IntegrityVerifier::new(),
            backup_dir: backup_dir.into(),
            target_database: target_database.into(),
            selection: None,
            deadline: None,
        }
    }

    /// Pick the artifact at this 0-based position of the newest-first listing instead of asking
    pub fn with_selection(mut self, index: Option<usize>) -> Self {
        self.selection = index;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Drive the state machine to completion
    pub async fn run(&self, operator: &mut dyn Operator) -> BackupResult<RestoreReport> {
        let started = Instant::now();
        let mut visited = Vec::new();
        let mut stage = RestoreStage::Selecting;

        loop {
            visited.push(stage.name());
            tracing::debug!(stage = stage.name(), "restore stage");

            stage = match stage {
                RestoreStage::Done(mut report) => {
                    report.stages = visited;
                    report.elapsed = started.elapsed();
                    tracing::info!(
                        target_db = %report.target_database,
                        artifact = %report.artifact.display(),
                        tables = report.table_count,
                        "restore complete"
                    );
                    return Ok(report);
                }
                RestoreStage::Aborted(err) => {
                    tracing::warn!(error = %err, "restore aborted before modifying the target");
                    return Err(err);
                }
                RestoreStage::Failed(err) => {
                    tracing::error!(error = %err, "restore failed after modifying the target");
                    return Err(err);
                }
                current => {
                    let destructive = current.is_destructive();
                    match self.step(current, operator).await {
                        Ok(next) => next,
                        Err(err) if destructive => RestoreStage::Failed(err),
                        Err(err) => RestoreStage::Aborted(err),
                    }
                }
            };
        }
    }

    /// One transition
    pub async fn step(&self, stage: RestoreStage, operator: &mut dyn Operator) -> BackupResult<RestoreStage> {
        match stage {
            RestoreStage::Selecting => self.select(operator),
            RestoreStage::Verifying(plan) => self.verify(plan, operator),
            RestoreStage::ConfirmGate(plan) => self.confirm(plan, operator),
            RestoreStage::Snapshotting(plan, token) => self.snapshot(plan, token, operator).await,
            RestoreStage::Preparing(plan, token) => self.prepare(plan, token),
            RestoreStage::Loading(plan, token, prepared) => self.load(plan, token, prepared).await,
            RestoreStage::PostVerify(plan) => self.post_verify(plan).await,
            terminal => Ok(terminal),
        }
    }

    fn select(&self, operator: &mut dyn Operator) -> BackupResult<RestoreStage> {
        if !is_valid_identifier(&self.target_database) {
            return Err(BackupError::InvalidName(self.target_database.clone()));
        }

        let mut artifacts = catalog::scan(&self.backup_dir)?;
        if artifacts.is_empty() {
            return Err(BackupError::NoArtifacts(self.backup_dir.clone()));
        }

        let index = match self.selection {
            Some(index) if index < artifacts.len() => index,
            Some(index) => {
                return Err(BackupError::Config(format!(
                    "selection {} is out of range, {} artifacts available",
                    index + 1,
                    artifacts.len()
                )))
            }
            None => operator
                .select_artifact(&artifacts)
                .filter(|i| *i < artifacts.len())
                .ok_or_else(|| BackupError::ConfirmationDeclined {
                    stage: "artifact selection".to_string(),
                })?,
        };

        let selected = artifacts.swap_remove(index);
        tracing::info!(artifact = %selected.path.display(), target_db = %self.target_database, "artifact selected");
        Ok(RestoreStage::Verifying(RestorePlan::new(selected, self.target_database.clone())))
    }

    fn verify(&self, mut plan: RestorePlan, operator: &mut dyn Operator) -> BackupResult<RestoreStage> {
        let path = plan.selected_artifact.path.clone();

        let verification = self.verifier.verify_artifact(&path)?;
        for warning in &verification.warnings {
            operator.warn(&warning.to_string());
        }

        if let Some(reason) = verification.reason() {
            if verification.is_overridable() {
                operator.warn(&format!(
                    "Integrity check failed: {}. The content may still load, but it is not what was backed up",
                    reason
                ));
            } else {
                operator.warn(&format!(
                    "Integrity check failed: {}. The artifact is unlikely to load; preparing it will stop before the target is touched",
                    reason
                ));
            }
            if !operator.affirm("Continue with this artifact anyway?") {
                return Err(BackupError::ConfirmationDeclined {
                    stage: "integrity warning".to_string(),
                });
            }
            tracing::warn!(artifact = %path.display(), reason = %reason, "operator chose to continue past integrity failure");
        }

        // A damaged stream just means no rename is planned; Preparing reports the damage
        if let Ok(Some(source)) = open_dump(&path).and_then(detect_source_database) {
            if source != plan.target_database {
                let rewrite = NameRewrite::new(&source, &plan.target_database);
                operator.warn(&format!(
                    "Dump was taken from '{}'; references will be rewritten to '{}'",
                    rewrite.source(),
                    rewrite.target()
                ));
                plan.database_name_rewrite = Some(rewrite);
            }
        }

        plan.verification = Some(verification);
        Ok(RestoreStage::ConfirmGate(plan))
    }

    fn confirm(&self, mut plan: RestorePlan, operator: &mut dyn Operator) -> BackupResult<RestoreStage> {
        operator.warn(&format!(
            "Restoring {} into database '{}'",
            plan.selected_artifact.file_name(),
            plan.target_database
        ));

        let token = run_gate(operator, &plan.target_database, RESTORE_KEYWORD)?;
        plan.confirmation_level = token.level();
        Ok(RestoreStage::Snapshotting(plan, token))
    }

    async fn snapshot(
        &self,
        mut plan: RestorePlan,
        token: FinalConfirmed,
        operator: &mut dyn Operator,
    ) -> BackupResult<RestoreStage> {
        let exists = self
            .engine
            .database_exists(token.target())
            .await
            .map_err(|e| BackupError::connection(token.target(), e))?;

        if !exists {
            tracing::info!(target_db = token.target(), "target does not exist yet, no snapshot needed");
            return Ok(RestoreStage::Preparing(plan, token));
        }

        match self
            .writer
            .create(token.target(), &self.backup_dir, BackupKind::PreRestore)
            .await
        {
            Ok(created) => {
                tracing::info!(snapshot = %created.artifact.path.display(), "pre-restore snapshot taken");
                plan.pre_restore_snapshot = Some(created.artifact);
            }
            Err(e) => {
                operator.warn(&format!("Pre-restore snapshot failed: {}", e));
                if !operator.affirm("Proceed WITHOUT a safety snapshot?") {
                    return Err(BackupError::ConfirmationDeclined {
                        stage: "snapshot failure".to_string(),
                    });
                }
                tracing::warn!(target_db = token.target(), error = %e, "continuing without pre-restore snapshot");
            }
        }

        Ok(RestoreStage::Preparing(plan, token))
    }

    fn prepare(&self, plan: RestorePlan, token: FinalConfirmed) -> BackupResult<RestoreStage> {
        let path = &plan.selected_artifact.path;
        let prepared = prepare_dump(path, &self.backup_dir, plan.database_name_rewrite.as_ref())
            .map_err(|e| BackupError::io(format!("Failed to prepare {}", path.display()), e))?;

        tracing::debug!(working = %prepared.path().display(), bytes = prepared.bytes, "dump prepared");
        Ok(RestoreStage::Loading(plan, token, prepared))
    }

    async fn load(
        &self,
        plan: RestorePlan,
        token: FinalConfirmed,
        prepared: PreparedDump,
    ) -> BackupResult<RestoreStage> {
        replace_database(
            self.engine.as_ref(),
            &token,
            Some(prepared.path()),
            plan.snapshot_path(),
            self.deadline,
        )
        .await?;

        Ok(RestoreStage::PostVerify(plan))
    }

    async fn post_verify(&self, plan: RestorePlan) -> BackupResult<RestoreStage> {
        let failed = |reason: String| BackupError::LoadFailed {
            database: plan.target_database.clone(),
            stage: "post-verify".to_string(),
            reason,
            snapshot: plan.snapshot_path(),
            target_dropped: true,
        };

        let table_count = self
            .engine
            .table_count(&plan.target_database)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if table_count == 0 {
            return Err(failed("database has no tables after load".to_string()));
        }

        Ok(RestoreStage::Done(RestoreReport {
            artifact: plan.selected_artifact.path.clone(),
            target_database: plan.target_database.clone(),
            pre_restore_snapshot: plan.snapshot_path(),
            renamed_from: plan.database_name_rewrite.as_ref().map(|r| r.source().to_string()),
            verification: plan.verification,
            table_count,
            stages: Vec::new(),
            elapsed: Duration::ZERO,
        }))
    }
}

/// Open an artifact as a line-readable SQL stream
pub(crate) fn open_dump(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    Ok(match CompressionAlgorithm::from_path(path) {
        Some(CompressionAlgorithm::Gzip) => Box::new(BufReader::new(GzDecoder::new(file))),
        _ => Box::new(BufReader::new(file)),
    })
}

/// Decompress `artifact` into a hidden working file in `work_dir`, applying `rewrite` line by line
pub(crate) fn prepare_dump(
    artifact: &Path,
    work_dir: &Path,
    rewrite: Option<&NameRewrite>,
) -> io::Result<PreparedDump> {
    let mut reader = open_dump(artifact)?;
    let mut file = tempfile::Builder::new()
        .prefix(".restore-")
        .suffix(".sql")
        .tempfile_in(work_dir)?;

    let mut bytes = 0u64;
    {
        let mut out = BufWriter::new(file.as_file_mut());
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let rewritten = match rewrite {
                Some(rw) => rw.apply(&line),
                None => std::borrow::Cow::Borrowed(line.as_slice()),
            };
            out.write_all(&rewritten)?;
            bytes += rewritten.len() as u64;
        }
        out.flush()?;
    }

    Ok(PreparedDump { file, bytes })
}

/// Drop, recreate and optionally load `token.target()`.
///
/// Every failure is a `LoadFailed` carrying `snapshot`, and records whether
/// the drop had already happened.
pub(crate) async fn replace_database(
    engine: &dyn DatabaseEngine,
    token: &FinalConfirmed,
    script: Option<&Path>,
    snapshot: Option<PathBuf>,
    deadline: Option<Duration>,
) -> BackupResult<()> {
    let target = token.target();
    let failed = |stage: &str, reason: String, target_dropped: bool| BackupError::LoadFailed {
        database: target.to_string(),
        stage: stage.to_string(),
        reason,
        snapshot: snapshot.clone(),
        target_dropped,
    };

    tracing::warn!(target_db = target, "dropping database");
    engine
        .drop_database(target)
        .await
        .map_err(|e| failed("drop", e.to_string(), false))?;

    engine
        .create_database(target)
        .await
        .map_err(|e| failed("create", e.to_string(), true))?;

    let Some(script) = script else {
        return Ok(());
    };

    let load = engine.load(target, script);
    let outcome = match deadline {
        Some(limit) => tokio::time::timeout(limit, load).await.map_err(|_| {
            failed(
                "load",
                format!("exceeded deadline of {}", humantime::format_duration(limit)),
                true,
            )
        })?,
        None => load.await,
    };
    outcome.map_err(|e| failed("load", e.to_string(), true))?;

    tracing::info!(target_db = target, script = %script.display(), "dump loaded");
    Ok(())
}
