/// Configuration management for .env files
///
/// Reads connection and backup settings from a `.env` style file and lets
/// process environment variables override individual keys.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::metadata::MetadataContext;
use crate::core::retention::RetentionPolicy;
use crate::utils::{
    is_valid_identifier, DEFAULT_BACKUP_DIR, DEFAULT_COLLATION,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_DEADLINE_SECS, DEFAULT_PROBE_TIMEOUT_SECS,
    DEFAULT_RETENTION_DAYS, DEFAULT_CHARSET, SENSITIVE_KEY_MARKERS,
};

#[derive(Debug, Clone)]
pub struct ConfigValue {
    pub key: String,
    pub value: String,
    pub comment: Option<String>,
}

pub struct ConfigManager {
    env_file: PathBuf,
    config: HashMap<String, ConfigValue>,
}

impl ConfigManager {
    /// Load configuration from a .env file
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();

        if !env_file.exists() {
            return Err(anyhow!("env file not found at {}", env_file.display()));
        }

        let content = fs::read_to_string(&env_file)
            .with_context(|| format!("Failed to read {}", env_file.display()))?;

        Ok(Self {
            env_file,
            config: Self::parse(&content),
        })
    }

    /// Load the env file if present, then overlay process environment variables
    pub fn load_with_env<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let mut manager = if env_file.as_ref().exists() {
            Self::load(&env_file)?
        } else {
            tracing::debug!(path = %env_file.as_ref().display(), "env file not found, using process environment only");
            Self {
                env_file: env_file.as_ref().to_path_buf(),
                config: HashMap::new(),
            }
        };

        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(key) {
                manager.set(*key, value);
            }
        }

        Ok(manager)
    }

    fn parse(content: &str) -> HashMap<String, ConfigValue> {
        let mut config = HashMap::new();
        let mut current_comment = None;

        for line in content.lines() {
            let line = line.trim();

            // Handle comments
            if line.starts_with('#') {
                current_comment = Some(line.trim_start_matches('#').trim().to_string());
                continue;
            }

            if line.is_empty() {
                current_comment = None;
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let value = unquote(value.trim()).to_string();

                config.insert(
                    key.clone(),
                    ConfigValue {
                        key,
                        value,
                        comment: current_comment.take(),
                    },
                );
            }
        }

        config
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.value.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Comment line that preceded `key` in the env file
    pub fn comment(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.comment.as_deref())
    }

    /// Set a configuration value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(existing) = self.config.get_mut(&key) {
            existing.value = value;
        } else {
            self.config.insert(
                key.clone(),
                ConfigValue {
                    key,
                    value,
                    comment: None,
                },
            );
        }
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|_| anyhow!("{} has an invalid value: {}", key, raw)),
            None => Ok(default),
        }
    }

    /// Build the connection parameters handed to the database engine
    pub fn connection(&self) -> Result<ConnectionConfig> {
        let database = self
            .get("DB_NAME")
            .ok_or_else(|| anyhow!("DB_NAME is not set in {}", self.env_file.display()))?
            .to_string();

        let charset = self.get("DB_CHARSET").unwrap_or(DEFAULT_CHARSET).to_string();
        let collation = self.get("DB_COLLATION").unwrap_or(DEFAULT_COLLATION).to_string();
        for (key, value) in [("DB_CHARSET", &charset), ("DB_COLLATION", &collation)] {
            if !is_valid_identifier(value) {
                return Err(anyhow!("{} is not a valid character set or collation name: {}", key, value));
            }
        }

        Ok(ConnectionConfig {
            host: self.get("DB_HOST").unwrap_or("localhost").to_string(),
            port: self.get_parsed("DB_PORT", 3306u16)?,
            user: self.get("DB_USER").unwrap_or("root").to_string(),
            password: self.get("DB_PASSWORD").map(|s| s.to_string()),
            database,
            charset,
            collation,
            mysql_bin: PathBuf::from(self.get("MYSQL_BIN").unwrap_or("mysql")),
            mysqldump_bin: PathBuf::from(self.get("MYSQLDUMP_BIN").unwrap_or("mysqldump")),
        })
    }

    /// Build the backup settings (directory, compression, retention, deadlines)
    pub fn backup_settings(&self) -> Result<BackupSettings> {
        let compression_level: u32 =
            self.get_parsed("BACKUP_COMPRESSION_LEVEL", DEFAULT_COMPRESSION_LEVEL)?;
        if compression_level > 9 {
            return Err(anyhow!(
                "BACKUP_COMPRESSION_LEVEL must be between 0 and 9, got {}",
                compression_level
            ));
        }

        let deadline_secs: u64 = self.get_parsed("BACKUP_DEADLINE_SECS", DEFAULT_DEADLINE_SECS)?;

        Ok(BackupSettings {
            backup_dir: PathBuf::from(self.get("BACKUP_DIR").unwrap_or(DEFAULT_BACKUP_DIR)),
            compression_level,
            retention: RetentionPolicy::new(
                self.get_parsed("BACKUP_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?,
            ),
            probe_timeout: Duration::from_secs(
                self.get_parsed("DB_PROBE_TIMEOUT_SECS", DEFAULT_PROBE_TIMEOUT_SECS)?,
            ),
            deadline: (deadline_secs > 0).then(|| Duration::from_secs(deadline_secs)),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.get("DB_NAME") {
            None => errors.push("DB_NAME is not set".to_string()),
            Some(name) if !is_valid_identifier(name) => {
                errors.push(format!("DB_NAME is not a valid database name: {}", name))
            }
            Some(_) => {}
        }

        if let Some(port) = self.get("DB_PORT") {
            if port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
                errors.push(format!("DB_PORT must be a port number: {}", port));
            }
        }

        for key in ["DB_CHARSET", "DB_COLLATION"] {
            if let Some(value) = self.get(key) {
                if !is_valid_identifier(value) {
                    errors.push(format!("{} is not a valid character set or collation name: {}", key, value));
                }
            }
        }

        if let Some(level) = self.get("BACKUP_COMPRESSION_LEVEL") {
            if level.parse::<u32>().map(|l| l > 9).unwrap_or(true) {
                errors.push(format!("BACKUP_COMPRESSION_LEVEL must be 0-9: {}", level));
            }
        }

        for key in [
            "BACKUP_RETENTION_DAYS",
            "DB_PROBE_TIMEOUT_SECS",
            "BACKUP_DEADLINE_SECS",
        ] {
            if let Some(value) = self.get(key) {
                if value.parse::<u64>().is_err() {
                    errors.push(format!("{} must be a whole number: {}", key, value));
                }
            }
        }

        errors
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.config.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Value suitable for printing, with secrets masked
    pub fn display_value(&self, key: &str) -> Option<String> {
        let value = self.get(key)?;
        if SENSITIVE_KEY_MARKERS.iter().any(|m| key.contains(m)) {
            Some("****".to_string())
        } else {
            Some(value.to_string())
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "DB_HOST",
    "DB_PORT",
    "DB_USER",
    "DB_PASSWORD",
    "DB_NAME",
    "DB_CHARSET",
    "DB_COLLATION",
    "BACKUP_DIR",
    "BACKUP_RETENTION_DAYS",
    "BACKUP_COMPRESSION_LEVEL",
    "DB_PROBE_TIMEOUT_SECS",
    "BACKUP_DEADLINE_SECS",
    "MYSQL_BIN",
    "MYSQLDUMP_BIN",
];

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Connection parameters for the target database engine
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub charset: String,
    pub collation: String,
    pub mysql_bin: PathBuf,
    pub mysqldump_bin: PathBuf,
}

impl ConnectionConfig {
    /// `user@host:port`, used in log lines and error messages
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Connection details recorded in each sidecar
    pub fn metadata_context(&self) -> MetadataContext {
        MetadataContext {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("collation", &self.collation)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub backup_dir: PathBuf,
    pub compression_level: u32,
    pub retention: RetentionPolicy,
    pub probe_timeout: Duration,
    pub deadline: Option<Duration>,
}

impl BackupSettings {
    /// Separate namespace for snapshots taken before a reset
    pub fn reset_dir(&self) -> PathBuf {
        self.backup_dir.join(crate::utils::RESET_BACKUP_SUBDIR)
    }

    /// Every directory retention applies to
    pub fn namespaces(&self) -> Vec<PathBuf> {
        vec![self.backup_dir.clone(), self.reset_dir()]
    }
}
