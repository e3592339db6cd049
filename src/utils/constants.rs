/// Defaults and fixed names shared by the backup engine and the CLI

/// Directory holding artifacts when BACKUP_DIR is not configured
pub const DEFAULT_BACKUP_DIR: &str = "backups";

/// Namespace (inside the backup directory) for snapshots taken before a reset
pub const RESET_BACKUP_SUBDIR: &str = "reset_backups";

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DEADLINE_SECS: u64 = 3600;

pub const DEFAULT_CHARSET: &str = "utf8mb4";
pub const DEFAULT_COLLATION: &str = "utf8mb4_unicode_ci";

/// Compressed artifact extension
pub const ARTIFACT_EXTENSION: &str = "sql.gz";

/// Uncompressed dumps written by older tooling
pub const LEGACY_ARTIFACT_EXTENSION: &str = "sql";

/// Suffix appended to an artifact file name to form its sidecar name
pub const METADATA_SUFFIX: &str = ".meta";

pub const METADATA_VERSION: &str = "1.0";

/// Smallest file that can plausibly hold a dump; anything shorter is treated as truncated
pub const MIN_ARTIFACT_BYTES: u64 = 64;

/// Lock file claimed inside a backup directory while it is being modified
pub const LOCK_FILE_NAME: &str = ".dbvault.lock";

/// Timestamp embedded in artifact names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const RESTORE_KEYWORD: &str = "RESTORE";
pub const RESET_KEYWORD: &str = "RESET";

/// Config keys whose values are never printed
pub const SENSITIVE_KEY_MARKERS: &[&str] = &["PASSWORD", "SECRET", "TOKEN"];

/// Maximum identifier length accepted by MySQL
pub const MAX_IDENTIFIER_LEN: usize = 64;
