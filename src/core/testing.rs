/// In-memory `DatabaseEngine` used by unit tests
///
/// Dumps are rendered as deterministic SQL text with a `CREATE DATABASE`
/// preamble and fully-qualified table names; loads parse that text back and
/// apply it to whichever database each statement names, the way the real
/// client would.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::engine::{DatabaseEngine, EngineError};

pub type Tables = BTreeMap<String, u64>;

#[derive(Default)]
pub struct FakeEngine {
    databases: Mutex<HashMap<String, Tables>>,
    operations: Mutex<Vec<String>>,
    altered: Mutex<Vec<String>>,
    pub fail_ping: AtomicBool,
    pub fail_load: AtomicBool,
    pub fail_create: AtomicBool,
    /// Write this many lines, then report a crashed dump process
    pub fail_dump_after_lines: Mutex<Option<usize>>,
    pub ping_delay: Mutex<Option<Duration>>,
    pub dump_delay: Mutex<Option<Duration>>,
}

fn exit(program: &str, stderr: impl Into<String>) -> EngineError {
    EngineError::Exit {
        program: program.to_string(),
        status: "exit status: 1".to_string(),
        stderr: stderr.into(),
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a database; `tables` maps table name to row count
    pub fn with_database(self, name: &str, tables: &[(&str, u64)]) -> Self {
        let tables = tables.iter().map(|(t, rows)| (t.to_string(), *rows)).collect();
        self.databases
            .lock()
            .unwrap()
            .insert(name.to_string(), tables);
        self
    }

    pub fn tables(&self, database: &str) -> Option<Tables> {
        self.databases.lock().unwrap().get(database).cloned()
    }

    pub fn total_rows(&self, database: &str) -> u64 {
        self.tables(database)
            .map(|t| t.values().sum())
            .unwrap_or(0)
    }

    /// Destructive operations performed so far, e.g. `drop shipping`
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    /// Databases named by `ALTER DATABASE` statements in loaded scripts
    pub fn altered(&self) -> Vec<String> {
        self.altered.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.operations.lock().unwrap().push(op);
    }

    pub fn render_dump(database: &str, tables: &Tables) -> String {
        let mut out = String::new();
        out.push_str("-- fake dump\n");
        out.push_str(&format!(
            "CREATE DATABASE /*!32312 IF NOT EXISTS*/ `{}` /*!40100 DEFAULT CHARACTER SET utf8mb4 */;\n",
            database
        ));
        out.push_str(&format!("USE `{}`;\n", database));
        for (table, rows) in tables {
            out.push_str(&format!("CREATE TABLE `{}`.`{}` (`id` int);\n", database, table));
            for id in 1..=*rows {
                out.push_str(&format!("INSERT INTO `{}`.`{}` VALUES ({});\n", database, table, id));
            }
        }
        // Routine written under a different collation, as mysqldump --routines does
        out.push_str(&format!(
            "ALTER DATABASE `{}` CHARACTER SET latin1 COLLATE latin1_swedish_ci ;\n",
            database
        ));
        out.push_str(&format!(
            "ALTER DATABASE `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci ;\n",
            database
        ));
        out
    }

    fn apply_script(&self, default_db: &str, script: &str) -> Result<(), EngineError> {
        let create_db = Regex::new(r"^CREATE DATABASE .*?`([^`]+)`").unwrap();
        let create_table = Regex::new(r"^CREATE TABLE (?:`([^`]+)`\.)?`([^`]+)`").unwrap();
        let insert = Regex::new(r"^INSERT INTO (?:`([^`]+)`\.)?`([^`]+)`").unwrap();
        let use_db = Regex::new(r"^USE `([^`]+)`").unwrap();
        let alter_db = Regex::new(r"^ALTER DATABASE `([^`]+)`").unwrap();

        let mut databases = self.databases.lock().unwrap();
        let mut current = default_db.to_string();

        for line in script.lines() {
            if let Some(caps) = create_db.captures(line) {
                databases.entry(caps[1].to_string()).or_default();
            } else if let Some(caps) = alter_db.captures(line) {
                if !databases.contains_key(&caps[1]) {
                    return Err(exit("mysql", format!("Unknown database '{}'", &caps[1])));
                }
                self.altered.lock().unwrap().push(caps[1].to_string());
            } else if let Some(caps) = use_db.captures(line) {
                current = caps[1].to_string();
            } else if let Some(caps) = create_table.captures(line) {
                let db = caps.get(1).map(|m| m.as_str()).unwrap_or(current.as_str()).to_string();
                let tables = databases
                    .get_mut(&db)
                    .ok_or_else(|| exit("mysql", format!("Unknown database '{}'", db)))?;
                tables.insert(caps[2].to_string(), 0);
            } else if let Some(caps) = insert.captures(line) {
                let db = caps.get(1).map(|m| m.as_str()).unwrap_or(current.as_str()).to_string();
                let rows = databases
                    .get_mut(&db)
                    .and_then(|tables| tables.get_mut(&caps[2]))
                    .ok_or_else(|| exit("mysql", format!("Table '{}.{}' doesn't exist", db, &caps[2])))?;
                *rows += 1;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DatabaseEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        let delay = *self.ping_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(exit("mysql", "Can't connect to MySQL server on 'localhost' (111)"));
        }
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> Result<bool, EngineError> {
        Ok(self.databases.lock().unwrap().contains_key(database))
    }

    async fn dump(&self, database: &str, sink: &mut (dyn Write + Send)) -> Result<u64, EngineError> {
        let delay = *self.dump_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let tables = self
            .tables(database)
            .ok_or_else(|| exit("mysqldump", format!("Got error: 1049: Unknown database '{}'", database)))?;
        let text = Self::render_dump(database, &tables);
        let fail_after = *self.fail_dump_after_lines.lock().unwrap();

        let mut written = 0u64;
        for (index, line) in text.lines().enumerate() {
            if fail_after == Some(index) {
                return Err(exit("mysqldump", "Lost connection to MySQL server during query"));
            }
            sink.write_all(line.as_bytes()).map_err(EngineError::Sink)?;
            sink.write_all(b"\n").map_err(EngineError::Sink)?;
            written += line.len() as u64 + 1;
        }

        Ok(written)
    }

    async fn drop_database(&self, database: &str) -> Result<(), EngineError> {
        self.record(format!("drop {}", database));
        self.databases.lock().unwrap().remove(database);
        Ok(())
    }

    async fn create_database(&self, database: &str) -> Result<(), EngineError> {
        self.record(format!("create {}", database));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(exit("mysql", "Error writing file './db.opt' (Errcode: 28 - No space left on device)"));
        }
        self.databases
            .lock()
            .unwrap()
            .insert(database.to_string(), Tables::new());
        Ok(())
    }

    async fn load(&self, database: &str, script: &Path) -> Result<(), EngineError> {
        self.record(format!("load {}", database));
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(exit("mysql", "ERROR 3 (HY000): Error writing file (Errcode: 28)"));
        }
        let text = std::fs::read_to_string(script).map_err(|source| EngineError::Io {
            program: "mysql".to_string(),
            source,
        })?;
        self.apply_script(database, &text)
    }

    async fn table_count(&self, database: &str) -> Result<u64, EngineError> {
        Ok(self.tables(database).map(|t| t.len() as u64).unwrap_or(0))
    }
}
