/// Backup artifact creation
///
/// A dump is streamed through a gzip encoder into a hidden temporary file in
/// the destination directory. The SHA-256 of the compressed bytes is computed
/// on the way to disk, and only then is the file renamed to its canonical
/// name, so a reader never sees a partial artifact.

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use crate::core::engine::{DatabaseEngine, EngineError};
use crate::core::error::{BackupError, BackupResult};
use crate::core::metadata::{BackupMetadata, MetadataContext, MetadataStore};
use crate::utils::{
    is_valid_identifier, ARTIFACT_EXTENSION, LEGACY_ARTIFACT_EXTENSION, TIMESTAMP_FORMAT,
};

/// Why an artifact was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    PreRestore,
    PreReset,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::PreRestore => "pre_restore",
            BackupKind::PreReset => "pre_reset",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(BackupKind::Manual),
            "pre_restore" => Some(BackupKind::PreRestore),
            "pre_reset" => Some(BackupKind::PreReset),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    None,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::None => "none",
        }
    }

    /// Infer from the file name; `None` for files that are not artifacts
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(&format!(".{}", ARTIFACT_EXTENSION)) {
            Some(CompressionAlgorithm::Gzip)
        } else if name.ends_with(&format!(".{}", LEGACY_ARTIFACT_EXTENSION)) {
            Some(CompressionAlgorithm::None)
        } else {
            None
        }
    }
}

/// An immutable logical dump of one database at one instant
#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub source_database: String,
    pub kind: Option<BackupKind>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub compression: CompressionAlgorithm,
    pub compression_level: Option<u32>,
    #[serde(skip)]
    pub modified: SystemTime,
}

impl BackupArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Describe an existing file, using its name for database, kind and timestamp when it follows
    /// the `{database}_{kind}_{timestamp}` convention
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let stat = fs::metadata(path)?;
        let modified = stat.modified()?;
        let compression = CompressionAlgorithm::from_path(path).unwrap_or(CompressionAlgorithm::None);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = strip_artifact_extension(&name);
        let parsed = parse_artifact_stem(stem);

        let (source_database, kind, created_at) = match parsed {
            Some(p) => (p.database, Some(p.kind), p.created_at),
            None => (stem.to_string(), None, DateTime::<Utc>::from(modified)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            source_database,
            kind,
            created_at,
            size_bytes: stat.len(),
            compression,
            compression_level: None,
            modified,
        })
    }
}

struct ParsedName {
    database: String,
    kind: BackupKind,
    created_at: DateTime<Utc>,
}

fn artifact_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<db>.+)_(?P<kind>manual|pre_restore|pre_reset)_(?P<ts>\d{8}_\d{6})(?:_(?P<seq>\d+))?$")
            .expect("artifact name pattern is valid")
    })
}

fn parse_artifact_stem(stem: &str) -> Option<ParsedName> {
    let caps = artifact_name_pattern().captures(stem)?;
    let kind = BackupKind::parse(&caps["kind"])?;
    let naive = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT).ok()?;

    Some(ParsedName {
        database: caps["db"].to_string(),
        kind,
        created_at: DateTime::from_naive_utc_and_offset(naive, Utc),
    })
}

fn strip_artifact_extension(name: &str) -> &str {
    name.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))
        .or_else(|| name.strip_suffix(&format!(".{}", LEGACY_ARTIFACT_EXTENSION)))
        .unwrap_or(name)
}

/// Canonical file name: `{database}_{kind}_{timestamp}[_{seq}].sql.gz`
pub fn artifact_file_name(database: &str, kind: BackupKind, at: DateTime<Utc>, seq: u32) -> String {
    let stamp = at.format(TIMESTAMP_FORMAT);
    if seq <= 1 {
        format!("{}_{}_{}.{}", database, kind.as_str(), stamp, ARTIFACT_EXTENSION)
    } else {
        format!("{}_{}_{}_{}.{}", database, kind.as_str(), stamp, seq, ARTIFACT_EXTENSION)
    }
}

/// Passes bytes through while hashing and counting them
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer, the lowercase hex digest, and the byte count
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Lowercase hex SHA-256 of a file's bytes
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Result of a successful `ArchiveWriter::create`
#[derive(Debug, Clone)]
pub struct CreatedBackup {
    pub artifact: BackupArtifact,
    pub metadata: BackupMetadata,
    pub dump_bytes: u64,
    pub elapsed: Duration,
}

pub struct ArchiveWriter {
    engine: Arc<dyn DatabaseEngine>,
    metadata: MetadataStore,
    context: MetadataContext,
    compression_level: u32,
    deadline: Option<Duration>,
}

impl ArchiveWriter {
    pub fn new(engine: Arc<dyn DatabaseEngine>, context: MetadataContext) -> Self {
        Self {
            engine,
            metadata: MetadataStore::new(),
            context,
            compression_level: crate::utils::DEFAULT_COMPRESSION_LEVEL,
            deadline: None,
        }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Dump `database` into a new compressed artifact inside `destination`.
    ///
    /// Leaves either a complete artifact under its canonical name plus its
    /// sidecar, or nothing at all.
    pub async fn create(
        &self,
        database: &str,
        destination: &Path,
        kind: BackupKind,
    ) -> BackupResult<CreatedBackup> {
        if !is_valid_identifier(database) {
            return Err(BackupError::InvalidName(database.to_string()));
        }

        fs::create_dir_all(destination).map_err(|e| {
            BackupError::io(format!("Failed to create backup directory {}", destination.display()), e)
        })?;

        let started = Instant::now();
        let started_at = Utc::now();
        tracing::info!(database, kind = %kind, destination = %destination.display(), "starting backup");

        let mut partial = tempfile::Builder::new()
            .prefix(&format!(".{}_{}.", database, kind.as_str()))
            .suffix(".partial")
            .tempfile_in(destination)
            .map_err(|e| BackupError::io("Failed to create temporary artifact", e))?;

        let (checksum, size_bytes, dump_bytes) = {
            let sink = HashingWriter::new(BufWriter::new(partial.as_file_mut()));
            let mut encoder = GzEncoder::new(sink, Compression::new(self.compression_level));

            let dump = self.engine.dump(database, &mut encoder);
            let outcome = match self.deadline {
                Some(limit) => tokio::time::timeout(limit, dump).await.map_err(|_| {
                    tracing::error!(database, "dump exceeded deadline, discarding partial artifact");
                    BackupError::Timeout {
                        stage: format!("dump of '{}'", database),
                        after: limit,
                    }
                })?,
                None => dump.await,
            };

            let dump_bytes = outcome.map_err(|e| match e {
                EngineError::Sink(source) => BackupError::CompressionFailed {
                    database: database.to_string(),
                    reason: source.to_string(),
                },
                other => BackupError::DumpFailed {
                    database: database.to_string(),
                    reason: other.to_string(),
                },
            })?;

            let compression_failed = |e: io::Error| BackupError::CompressionFailed {
                database: database.to_string(),
                reason: e.to_string(),
            };
            let sink = encoder.finish().map_err(compression_failed)?;
            let (buffered, checksum, size_bytes) = sink.finish();
            buffered
                .into_inner()
                .map_err(|e| compression_failed(e.into_error()))?;

            (checksum, size_bytes, dump_bytes)
        };

        partial
            .as_file()
            .sync_all()
            .map_err(|e| BackupError::io("Failed to flush temporary artifact", e))?;

        let final_path = claim_canonical_name(partial, destination, database, kind, started_at)?;

        let mut artifact = BackupArtifact::from_file(&final_path)
            .map_err(|e| BackupError::io(format!("Failed to stat {}", final_path.display()), e))?;
        artifact.created_at = started_at;
        artifact.compression_level = Some(self.compression_level);
        debug_assert_eq!(artifact.size_bytes, size_bytes);

        let metadata = match self.metadata.write(&artifact, &self.context, &checksum) {
            Ok(metadata) => metadata,
            Err(e) => return Err(discard_unpaired(&final_path, e)),
        };

        let elapsed = started.elapsed();
        tracing::info!(
            artifact = %final_path.display(),
            size_bytes,
            dump_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "backup complete"
        );

        Ok(CreatedBackup {
            artifact,
            metadata,
            dump_bytes,
            elapsed,
        })
    }
}

/// An artifact whose sidecar could not be written is removed again
fn discard_unpaired(artifact: &Path, err: BackupError) -> BackupError {
    let mut reason = err.to_string();
    match fs::remove_file(artifact) {
        Ok(()) => {
            tracing::error!(artifact = %artifact.display(), error = %err, "sidecar failed, artifact discarded");
        }
        Err(remove_err) => {
            tracing::error!(
                artifact = %artifact.display(),
                error = %err,
                remove_error = %remove_err,
                "sidecar failed and the artifact could not be removed"
            );
            reason = format!("{}; removing the artifact also failed: {}", reason, remove_err);
        }
    }
    BackupError::SidecarWrite {
        artifact: artifact.to_path_buf(),
        reason,
    }
}

/// Rename the finished temp file to the first free canonical name.
///
/// Uses a no-clobber rename, so an artifact created concurrently under the same
/// name is never replaced.
fn claim_canonical_name(
    mut partial: tempfile::NamedTempFile,
    destination: &Path,
    database: &str,
    kind: BackupKind,
    at: DateTime<Utc>,
) -> BackupResult<PathBuf> {
    let mut seq = 1;
    loop {
        let candidate = destination.join(artifact_file_name(database, kind, at, seq));
        match partial.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                partial = e.file;
                seq += 1;
            }
            Err(e) => {
                return Err(BackupError::io(
                    format!("Failed to move artifact into place at {}", candidate.display()),
                    e.error,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::FakeEngine;
    use crate::utils::METADATA_SUFFIX;
    use flate2::read::GzDecoder;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn context() -> MetadataContext {
        MetadataContext {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
        }
    }

    fn shipping_engine() -> FakeEngine {
        FakeEngine::new().with_database("shipping", &[("customers", 40), ("shipments", 50), ("users", 10)])
    }

    fn visible_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_create_writes_artifact_and_sidecar() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::new(Arc::new(shipping_engine()), context());

        let created = writer.create("shipping", dir.path(), BackupKind::Manual).await.unwrap();
        let artifact = &created.artifact;

        assert!(artifact.path.exists());
        assert!(artifact.file_name().starts_with("shipping_manual_"));
        assert!(artifact.file_name().ends_with(".sql.gz"));
        assert_eq!(artifact.source_database, "shipping");
        assert_eq!(artifact.compression, CompressionAlgorithm::Gzip);
        assert_eq!(artifact.compression_level, Some(6));

        assert_eq!(created.metadata.checksum, checksum_file(&artifact.path).unwrap());
        assert_eq!(created.metadata.source_database, "shipping");
        assert_eq!(created.metadata.size_bytes, artifact.size_bytes);

        let stored = MetadataStore::new().read(&artifact.path).unwrap().unwrap();
        assert_eq!(stored, created.metadata);

        // Only the artifact and its sidecar, no temp files left behind
        assert_eq!(visible_files(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn test_artifact_decompresses_to_dump() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::new(Arc::new(shipping_engine()), context()).with_compression_level(9);

        let created = writer.create("shipping", dir.path(), BackupKind::Manual).await.unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&created.artifact.path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("CREATE DATABASE /*!32312 IF NOT EXISTS*/ `shipping`"));
        assert_eq!(text.matches("INSERT INTO").count(), 100);
        assert_eq!(created.dump_bytes, text.len() as u64);
    }

    #[tokio::test]
    async fn test_crashed_dump_leaves_nothing() {
        let dir = tempdir().unwrap();
        let engine = shipping_engine();
        *engine.fail_dump_after_lines.lock().unwrap() = Some(20);
        let writer = ArchiveWriter::new(Arc::new(engine), context());

        let err = writer.create("shipping", dir.path(), BackupKind::Manual).await.unwrap_err();

        assert!(matches!(err, BackupError::DumpFailed { .. }));
        assert!(visible_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_deadline_discards_partial_artifact() {
        let dir = tempdir().unwrap();
        let engine = shipping_engine();
        *engine.dump_delay.lock().unwrap() = Some(Duration::from_secs(30));
        let writer = ArchiveWriter::new(Arc::new(engine), context())
            .with_deadline(Some(Duration::from_millis(50)));

        let err = writer.create("shipping", dir.path(), BackupKind::Manual).await.unwrap_err();

        assert!(matches!(err, BackupError::Timeout { .. }));
        assert!(visible_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_database_is_dump_failure() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::new(Arc::new(FakeEngine::new()), context());

        let err = writer.create("missing", dir.path(), BackupKind::Manual).await.unwrap_err();
        match err {
            BackupError::DumpFailed { database, reason } => {
                assert_eq!(database, "missing");
                assert!(reason.contains("Unknown database"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_dump() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(shipping_engine());
        engine.fail_ping.store(true, Ordering::SeqCst);
        let writer = ArchiveWriter::new(engine, context());

        let err = writer.create("shipping; DROP", dir.path(), BackupKind::Manual).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_same_second_backups_get_distinct_names() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::new(Arc::new(shipping_engine()), context());

        let first = writer.create("shipping", dir.path(), BackupKind::Manual).await.unwrap();
        let second = writer.create("shipping", dir.path(), BackupKind::Manual).await.unwrap();

        assert_ne!(first.artifact.path, second.artifact.path);
        assert!(first.artifact.path.exists());
        assert!(second.artifact.path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_sidecar_discards_artifact() {
        let dir = tempdir().unwrap();
        // Occupy every sidecar name the backup could get over the next few seconds
        let now = Utc::now();
        for offset in -1..=5 {
            let at = now + chrono::Duration::seconds(offset);
            let name = artifact_file_name("shipping", BackupKind::PreRestore, at, 1);
            fs::create_dir(dir.path().join(format!("{}{}", name, METADATA_SUFFIX))).unwrap();
        }
        let writer = ArchiveWriter::new(Arc::new(shipping_engine()), context());

        let err = writer.create("shipping", dir.path(), BackupKind::PreRestore).await.unwrap_err();

        match &err {
            BackupError::SidecarWrite { artifact, .. } => assert!(!artifact.exists()),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.recovery_hint().unwrap().contains("no backup was kept"));
        assert!(visible_files(dir.path()).iter().all(|n| n.ends_with(METADATA_SUFFIX)));
    }

    #[test]
    fn test_artifact_names_round_trip_through_parser() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z").unwrap().with_timezone(&Utc);
        let name = artifact_file_name("ship_db", BackupKind::PreRestore, at, 1);
        assert_eq!(name, "ship_db_pre_restore_20260304_050607.sql.gz");

        let parsed = parse_artifact_stem(strip_artifact_extension(&name)).unwrap();
        assert_eq!(parsed.database, "ship_db");
        assert_eq!(parsed.kind, BackupKind::PreRestore);
        assert_eq!(parsed.created_at, at);

        let seq = artifact_file_name("ship_db", BackupKind::Manual, at, 3);
        assert_eq!(seq, "ship_db_manual_20260304_050607_3.sql.gz");
        assert!(parse_artifact_stem(strip_artifact_extension(&seq)).is_some());
    }

    #[test]
    fn test_legacy_file_described_from_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old_dump.sql");
        fs::write(&path, "CREATE TABLE t (id int);\n").unwrap();

        let artifact = BackupArtifact::from_file(&path).unwrap();
        assert_eq!(artifact.compression, CompressionAlgorithm::None);
        assert_eq!(artifact.source_database, "old_dump");
        assert!(artifact.kind.is_none());
    }
}
