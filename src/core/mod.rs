pub mod archive;
pub mod catalog;
pub mod config;
pub mod confirm;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod probe;
pub mod reset;
pub mod restore;
pub mod retention;
pub mod rewrite;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{ArchiveWriter, BackupArtifact, BackupKind};
pub use config::ConfigManager;
pub use confirm::Operator;
pub use engine::{DatabaseEngine, MySqlEngine};
pub use error::{BackupError, BackupResult};
pub use lock::DirectoryLock;
pub use metadata::MetadataStore;
pub use probe::ConnectionProbe;
pub use reset::ResetOrchestrator;
pub use restore::RestoreOrchestrator;
pub use retention::{RetentionManager, RetentionPolicy};
pub use verify::IntegrityVerifier;
