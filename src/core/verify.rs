/// Artifact integrity verification
///
/// Checks run in order: size, container self-test, checksum. The first two
/// are hard failures. A checksum mismatch is reported as an invalid verdict the
/// operator may still choose to proceed past; missing metadata and legacy
/// uncompressed dumps only produce warnings.

use flate2::read::GzDecoder;
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::core::archive::{checksum_file, CompressionAlgorithm};
use crate::core::error::{BackupError, BackupResult};
use crate::core::metadata::{BackupMetadata, MetadataStore};
use crate::utils::MIN_ARTIFACT_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InvalidReason {
    Missing,
    TooSmall { size: u64, minimum: u64 },
    CorruptContainer { detail: String },
    ChecksumMismatch { expected: String, actual: String },
}

impl InvalidReason {
    /// Whether an operator may knowingly continue with the artifact
    pub fn is_overridable(&self) -> bool {
        matches!(self, InvalidReason::ChecksumMismatch { .. })
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::Missing => write!(f, "artifact does not exist"),
            InvalidReason::TooSmall { size, minimum } => {
                write!(f, "artifact is {} bytes, below the {} byte minimum (truncated dump?)", size, minimum)
            }
            InvalidReason::CorruptContainer { detail } => {
                write!(f, "compressed container is damaged: {}", detail)
            }
            InvalidReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: sidecar has {}, artifact hashes to {}", expected, actual)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityWarning {
    MetadataMissing,
    MetadataUnreadable { detail: String },
    UncompressedLegacy,
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityWarning::MetadataMissing => {
                write!(f, "no metadata sidecar; checksum could not be compared")
            }
            IntegrityWarning::MetadataUnreadable { detail } => {
                write!(f, "metadata sidecar ignored ({}); checksum could not be compared", detail)
            }
            IntegrityWarning::UncompressedLegacy => {
                write!(f, "legacy uncompressed dump; container self-test skipped")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid(InvalidReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub path: PathBuf,
    pub verdict: Verdict,
    pub warnings: Vec<IntegrityWarning>,
    /// Recomputed SHA-256, when the artifact got far enough to be hashed
    pub checksum: Option<String>,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.verdict == Verdict::Valid
    }

    pub fn reason(&self) -> Option<&InvalidReason> {
        match &self.verdict {
            Verdict::Valid => None,
            Verdict::Invalid(reason) => Some(reason),
        }
    }

    /// Invalid, but only in a way the operator may override
    pub fn is_overridable(&self) -> bool {
        self.reason().map(InvalidReason::is_overridable).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    minimum_size: u64,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self {
            minimum_size: MIN_ARTIFACT_BYTES,
        }
    }
}

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `path` against its own sidecar.
    ///
    /// A sidecar that exists but cannot be read or parsed is treated like a
    /// missing one, with a warning that says so.
    pub fn verify_artifact(&self, path: &Path) -> BackupResult<Verification> {
        let (metadata, unreadable) = match MetadataStore::new().read(path) {
            Ok(metadata) => (metadata, None),
            Err(e) => {
                tracing::warn!(artifact = %path.display(), error = %e, "ignoring unreadable metadata");
                (None, Some(e.to_string()))
            }
        };

        let mut verification = self.verify(path, metadata.as_ref())?;
        if let Some(detail) = unreadable {
            verification.warnings.retain(|w| *w != IntegrityWarning::MetadataMissing);
            verification.warnings.push(IntegrityWarning::MetadataUnreadable { detail });
        }
        Ok(verification)
    }

    /// Verify `path`, comparing against `metadata` when a sidecar exists.
    ///
    /// Read-only; calling it twice on an unmodified artifact gives the same result.
    pub fn verify(&self, path: &Path, metadata: Option<&BackupMetadata>) -> BackupResult<Verification> {
        let mut warnings = Vec::new();
        let invalid = |reason: InvalidReason,
                       warnings: Vec<IntegrityWarning>,
                       checksum: Option<String>|
         -> BackupResult<Verification> {
            tracing::warn!(artifact = %path.display(), reason = %reason, "artifact failed verification");
            Ok(Verification {
                path: path.to_path_buf(),
                verdict: Verdict::Invalid(reason),
                warnings,
                checksum,
            })
        };

        // (a) presence and plausible size
        let size = match fs::metadata(path) {
            Ok(stat) if stat.is_file() => stat.len(),
            Ok(_) => return invalid(InvalidReason::Missing, warnings, None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return invalid(InvalidReason::Missing, warnings, None)
            }
            Err(e) => return Err(BackupError::io(format!("Failed to stat {}", path.display()), e)),
        };
        if size < self.minimum_size {
            return invalid(
                InvalidReason::TooSmall {
                    size,
                    minimum: self.minimum_size,
                },
                warnings,
                None,
            );
        }

        // (b) container self-test
        match CompressionAlgorithm::from_path(path) {
            Some(CompressionAlgorithm::Gzip) => {
                if let Err(e) = self_test_gzip(path) {
                    if e.kind() == io::ErrorKind::NotFound {
                        return invalid(InvalidReason::Missing, warnings, None);
                    }
                    return invalid(
                        InvalidReason::CorruptContainer {
                            detail: e.to_string(),
                        },
                        warnings,
                        None,
                    );
                }
            }
            _ => warnings.push(IntegrityWarning::UncompressedLegacy),
        }

        // (c) checksum against the sidecar
        let actual = checksum_file(path)
            .map_err(|e| BackupError::io(format!("Failed to hash {}", path.display()), e))?;

        match metadata {
            Some(meta) if !meta.checksum.eq_ignore_ascii_case(&actual) => {
                return invalid(
                    InvalidReason::ChecksumMismatch {
                        expected: meta.checksum.clone(),
                        actual: actual.clone(),
                    },
                    warnings,
                    Some(actual),
                );
            }
            Some(_) => {}
            None => warnings.push(IntegrityWarning::MetadataMissing),
        }

        tracing::debug!(artifact = %path.display(), warnings = warnings.len(), "artifact verified");
        Ok(Verification {
            path: path.to_path_buf(),
            verdict: Verdict::Valid,
            warnings,
            checksum: Some(actual),
        })
    }
}

/// Decompress the whole stream into a sink so the gzip CRC and length trailer are checked
fn self_test_gzip(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())
}
