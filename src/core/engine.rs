/// Database engine integration
///
/// Every interaction with the relational store goes through `DatabaseEngine`.
/// `MySqlEngine` drives the `mysql` and `mysqldump` client programs; tests use
/// an in-memory double.

use async_trait::async_trait;
use std::io::{self, Write};
use std::path::Path;
use std::process::Stdio;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::core::config::ConnectionConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    /// The consumer of dump output rejected a write (compression or disk failure)
    #[error("dump output could not be written: {0}")]
    Sink(#[source] io::Error),

    #[error("i/o error while talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("unexpected response from {program}: {output}")]
    Unexpected { program: String, output: String },
}

/// Narrow interface over the database engine's client tooling
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Trivial round-trip query against the server
    async fn ping(&self) -> Result<(), EngineError>;

    async fn database_exists(&self, database: &str) -> Result<bool, EngineError>;

    /// Stream a logical dump of `database` into `sink`, returning the number of bytes produced.
    ///
    /// The dump preserves transactional consistency, routines, triggers and events,
    /// and starts with a `CREATE DATABASE` / `USE` preamble.
    async fn dump(&self, database: &str, sink: &mut (dyn Write + Send)) -> Result<u64, EngineError>;

    async fn drop_database(&self, database: &str) -> Result<(), EngineError>;

    /// Create `database` with the configured character set and collation
    async fn create_database(&self, database: &str) -> Result<(), EngineError>;

    /// Execute the SQL script at `script` with `database` as the default schema
    async fn load(&self, database: &str, script: &Path) -> Result<(), EngineError>;

    async fn table_count(&self, database: &str) -> Result<u64, EngineError>;
}

/// Quote an identifier with backticks, doubling embedded backticks
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a string literal for use inside SQL text
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// `DatabaseEngine` backed by the MySQL/MariaDB command line clients
pub struct MySqlEngine {
    config: ConnectionConfig,
    connect_timeout_secs: u64,
}

impl MySqlEngine {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connect_timeout_secs: 10,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs.max(1);
        self
    }

    /// Write a client option file so credentials never appear in the process table.
    ///
    /// The file is created with owner-only permissions and removed when dropped.
    fn defaults_file(&self) -> Result<NamedTempFile, EngineError> {
        let mut file = tempfile::Builder::new()
            .prefix("dbvault-client-")
            .suffix(".cnf")
            .tempfile()
            .map_err(|source| EngineError::Io {
                program: "defaults file".to_string(),
                source,
            })?;

        let mut contents = format!(
            "[client]\nhost={}\nport={}\nuser={}\n",
            self.config.host, self.config.port, self.config.user
        );
        if let Some(password) = &self.config.password {
            contents.push_str(&format!(
                "password=\"{}\"\n",
                password.replace('\\', "\\\\").replace('"', "\\\"")
            ));
        }

        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| EngineError::Io {
                program: "defaults file".to_string(),
                source,
            })?;

        Ok(file)
    }

    fn command(&self, program: &Path, defaults: &NamedTempFile) -> Command {
        let mut cmd = Command::new(program);
        // --defaults-extra-file must be the first option
        cmd.arg(format!("--defaults-extra-file={}", defaults.path().display()))
            .arg(format!("--connect-timeout={}", self.connect_timeout_secs))
            .arg(format!("--default-character-set={}", self.config.charset))
            .kill_on_drop(true);
        cmd
    }

    /// Run a statement through `mysql` and return its batch-mode stdout
    async fn query(&self, sql: &str) -> Result<String, EngineError> {
        let defaults = self.defaults_file()?;
        let program = self.config.mysql_bin.display().to_string();

        let output = self
            .command(&self.config.mysql_bin, &defaults)
            .args(["--batch", "--skip-column-names", "-e", sql])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Exit {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Collect a child's stderr in the background so a full pipe never blocks it
fn drain<R>(mut reader: R) -> tokio::task::JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf).await;
        buf
    })
}

#[async_trait]
impl DatabaseEngine for MySqlEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        let output = self.query("SELECT 1").await?;
        if output == "1" {
            Ok(())
        } else {
            Err(EngineError::Unexpected {
                program: self.config.mysql_bin.display().to_string(),
                output,
            })
        }
    }

    async fn database_exists(&self, database: &str) -> Result<bool, EngineError> {
        let sql = format!(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = {}",
            quote_literal(database)
        );
        Ok(!self.query(&sql).await?.is_empty())
    }

    async fn dump(&self, database: &str, sink: &mut (dyn Write + Send)) -> Result<u64, EngineError> {
        let defaults = self.defaults_file()?;
        let program = self.config.mysqldump_bin.display().to_string();

        let mut child = self
            .command(&self.config.mysqldump_bin, &defaults)
            .args([
                "--single-transaction",
                "--routines",
                "--triggers",
                "--events",
                "--hex-blob",
                "--databases",
                database,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| EngineError::Unexpected {
            program: program.clone(),
            output: "stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().map(drain);

        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = stdout.read(&mut buf).await.map_err(|source| EngineError::Io {
                program: program.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            // An early return here drops the child, which kills mysqldump
            sink.write_all(&buf[..n]).map_err(EngineError::Sink)?;
            total += n as u64;
        }

        let status = child.wait().await.map_err(|source| EngineError::Io {
            program: program.clone(),
            source,
        })?;
        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(EngineError::Exit {
                program,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            tracing::warn!(database, stderr = %stderr.trim(), "mysqldump reported warnings");
        }

        sink.flush().map_err(EngineError::Sink)?;
        Ok(total)
    }

    async fn drop_database(&self, database: &str) -> Result<(), EngineError> {
        self.query(&format!("DROP DATABASE IF EXISTS {}", quote_identifier(database)))
            .await
            .map(|_| ())
    }

    async fn create_database(&self, database: &str) -> Result<(), EngineError> {
        self.query(&format!(
            "CREATE DATABASE {} CHARACTER SET {} COLLATE {}",
            quote_identifier(database),
            self.config.charset,
            self.config.collation
        ))
        .await
        .map(|_| ())
    }

    async fn load(&self, database: &str, script: &Path) -> Result<(), EngineError> {
        let defaults = self.defaults_file()?;
        let program = self.config.mysql_bin.display().to_string();

        let input = std::fs::File::open(script).map_err(|source| EngineError::Io {
            program: program.clone(),
            source,
        })?;

        let output = self
            .command(&self.config.mysql_bin, &defaults)
            .arg(database)
            .stdin(Stdio::from(input))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Exit {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    async fn table_count(&self, database: &str) -> Result<u64, EngineError> {
        let sql = format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = {}",
            quote_literal(database)
        );
        let output = self.query(&sql).await?;
        output.parse::<u64>().map_err(|_| EngineError::Unexpected {
            program: self.config.mysql_bin.display().to_string(),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(password: Option<&str>) -> ConnectionConfig {
        ConnectionConfig {
            host: "db.internal".to_string(),
            port: 3307,
            user: "backup".to_string(),
            password: password.map(|p| p.to_string()),
            database: "shipping".to_string(),
            charset: "utf8mb4".to_string(),
            collation: "utf8mb4_unicode_ci".to_string(),
            mysql_bin: PathBuf::from("mysql"),
            mysqldump_bin: PathBuf::from("mysqldump"),
        }
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("shipping"), "`shipping`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("shipping"), "'shipping'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_defaults_file_holds_credentials() {
        let engine = MySqlEngine::new(config(Some("pa\"ss")));
        let file = engine.defaults_file().unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();

        assert!(contents.starts_with("[client]\n"));
        assert!(contents.contains("host=db.internal\n"));
        assert!(contents.contains("port=3307\n"));
        assert!(contents.contains("password=\"pa\\\"ss\"\n"));
    }

    #[test]
    fn test_defaults_file_without_password() {
        let engine = MySqlEngine::new(config(None));
        let file = engine.defaults_file().unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(!contents.contains("password"));
    }

    /// Stand-in client program written as a shell script
    #[cfg(unix)]
    fn fake_client(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dump_streams_stdout_and_keeps_secrets_out_of_argv() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(Some("s3cret"));
        cfg.mysqldump_bin = fake_client(
            dir.path(),
            "mysqldump",
            "printf '%s\\n' \"$@\"\necho 'mysqldump: [Warning] column statistics unavailable' >&2\n",
        );
        let engine = MySqlEngine::new(cfg);

        let mut out = Vec::new();
        let written = engine.dump("shipping", &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(written, text.len() as u64);
        assert!(text.starts_with("--defaults-extra-file="));
        assert!(text.contains("--single-transaction\n"));
        assert!(text.contains("--routines\n"));
        assert!(text.ends_with("--databases\nshipping\n"));
        assert!(!text.contains("s3cret"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dump_failure_reports_exit_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(None);
        // More stderr than a pipe buffer holds, so an undrained pipe would hang the child
        cfg.mysqldump_bin = fake_client(
            dir.path(),
            "mysqldump",
            "echo 'CREATE DATABASE `shipping`;'\n\
             head -c 200000 /dev/zero | tr '\\000' '.' >&2\n\
             echo \"mysqldump: Got error: 1045: Access denied for user 'backup'\" >&2\n\
             exit 2\n",
        );
        let engine = MySqlEngine::new(cfg);

        let mut out = Vec::new();
        let result = tokio::time::timeout(std::time::Duration::from_secs(20), engine.dump("shipping", &mut out))
            .await
            .expect("dump should not hang on a full stderr pipe");

        match result {
            Err(EngineError::Exit { program, status, stderr }) => {
                assert!(program.ends_with("mysqldump"));
                assert!(status.contains('2'));
                assert!(stderr.ends_with("Access denied for user 'backup'"));
                assert!(stderr.len() > 200_000);
            }
            other => panic!("expected exit error, got {:?}", other),
        }
        assert_eq!(String::from_utf8(out).unwrap(), "CREATE DATABASE `shipping`;\n");
    }

    #[tokio::test]
    async fn test_missing_client_binary_is_spawn_error() {
        let mut cfg = config(None);
        cfg.mysql_bin = PathBuf::from("/nonexistent/dbvault-mysql");
        let engine = MySqlEngine::new(cfg);

        match engine.ping().await {
            Err(EngineError::Spawn { program, .. }) => assert!(program.contains("dbvault-mysql")),
            other => panic!("expected spawn error, got {:?}", other),
        }
    }
}
