/// Sidecar descriptors
///
/// Each artifact `x.sql.gz` has a plain `KEY=value` file `x.sql.gz.meta` next to it.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::core::archive::{BackupArtifact, CompressionAlgorithm};
use crate::core::error::{BackupError, BackupResult};
use crate::utils::{METADATA_SUFFIX, METADATA_VERSION};

/// Connection details recorded alongside each artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataContext {
    pub host: String,
    pub port: u16,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupMetadata {
    pub schema_version: String,
    pub backup_date: DateTime<Utc>,
    pub backup_file: String,
    pub source_database: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub compression: CompressionAlgorithm,
    pub compression_level: Option<u32>,
    pub encrypted: bool,
}

impl BackupMetadata {
    fn render(&self) -> String {
        let level = self
            .compression_level
            .map(|l| l.to_string())
            .unwrap_or_default();

        let mut out = String::from("# dbvault backup metadata\n");
        for (key, value) in [
            ("BACKUP_METADATA_VERSION", self.schema_version.clone()),
            ("BACKUP_DATE", self.backup_date.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("BACKUP_FILE", self.backup_file.clone()),
            ("DATABASE_NAME", self.source_database.clone()),
            ("DATABASE_HOST", self.host.clone()),
            ("DATABASE_PORT", self.port.to_string()),
            ("DATABASE_USER", self.user.clone()),
            ("BACKUP_SIZE", self.size_bytes.to_string()),
            ("CHECKSUM", self.checksum.clone()),
            ("COMPRESSION", self.compression.as_str().to_string()),
            ("COMPRESSION_LEVEL", level),
            ("ENCRYPTED", self.encrypted.to_string()),
        ] {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    fn parse(content: &str) -> Result<Self, String> {
        let values: HashMap<&str, &str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let required = |key: &str| -> Result<&str, String> {
            values
                .get(key)
                .copied()
                .ok_or_else(|| format!("missing {}", key))
        };
        let number = |key: &str| -> Result<u64, String> {
            required(key)?
                .parse::<u64>()
                .map_err(|_| format!("{} is not a number", key))
        };

        let backup_date = DateTime::parse_from_rfc3339(required("BACKUP_DATE")?)
            .map_err(|e| format!("BACKUP_DATE: {}", e))?
            .with_timezone(&Utc);

        let port = u16::try_from(number("DATABASE_PORT")?)
            .map_err(|_| "DATABASE_PORT out of range".to_string())?;

        let compression = match required("COMPRESSION")? {
            "gzip" => CompressionAlgorithm::Gzip,
            "none" => CompressionAlgorithm::None,
            other => return Err(format!("unknown COMPRESSION '{}'", other)),
        };

        let compression_level = match values.get("COMPRESSION_LEVEL").copied() {
            None | Some("") => None,
            Some(level) => Some(
                level
                    .parse::<u32>()
                    .map_err(|_| "COMPRESSION_LEVEL is not a number".to_string())?,
            ),
        };

        let encrypted = match values.get("ENCRYPTED").copied() {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => return Err(format!("ENCRYPTED must be true or false, got '{}'", other)),
        };

        Ok(Self {
            schema_version: required("BACKUP_METADATA_VERSION")?.to_string(),
            backup_date,
            backup_file: required("BACKUP_FILE")?.to_string(),
            source_database: required("DATABASE_NAME")?.to_string(),
            host: required("DATABASE_HOST")?.to_string(),
            port,
            user: required("DATABASE_USER")?.to_string(),
            size_bytes: number("BACKUP_SIZE")?,
            checksum: required("CHECKSUM")?.to_lowercase(),
            compression,
            compression_level,
            encrypted,
        })
    }
}

/// Path of the sidecar for `artifact`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Default, Clone)]
pub struct MetadataStore;

impl MetadataStore {
    pub fn new() -> Self {
        Self
    }

    /// Build and atomically persist the sidecar for a freshly written artifact
    pub fn write(
        &self,
        artifact: &BackupArtifact,
        context: &MetadataContext,
        checksum: &str,
    ) -> BackupResult<BackupMetadata> {
        let backup_date = artifact
            .created_at
            .with_nanosecond(0)
            .unwrap_or(artifact.created_at);

        let metadata = BackupMetadata {
            schema_version: METADATA_VERSION.to_string(),
            backup_date,
            backup_file: artifact.file_name(),
            source_database: artifact.source_database.clone(),
            host: context.host.clone(),
            port: context.port,
            user: context.user.clone(),
            size_bytes: artifact.size_bytes,
            checksum: checksum.to_lowercase(),
            compression: artifact.compression,
            compression_level: artifact.compression_level,
            encrypted: false,
        };

        let path = sidecar_path(&artifact.path);
        persist_atomically(&path, metadata.render().as_bytes()).map_err(|e| BackupError::Metadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(sidecar = %path.display(), checksum = %metadata.checksum, "metadata written");
        Ok(metadata)
    }

    /// Read the sidecar of `artifact`; `Ok(None)` when there is none
    pub fn read(&self, artifact: &Path) -> BackupResult<Option<BackupMetadata>> {
        let path = sidecar_path(artifact);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::Metadata {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        BackupMetadata::parse(&content)
            .map(Some)
            .map_err(|reason| BackupError::Metadata { path, reason })
    }
}

/// Write to a hidden temp file in the same directory, then rename over `path`
fn persist_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".meta-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
