/// CLI argument parsing

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "dbvault")]
#[command(author, version = VERSION_WITH_BUILD, about = "Verified database backups, retention and guarded restores", long_about = None)]
pub struct Cli {
    /// Env file with DB_* and BACKUP_* settings
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    /// Override BACKUP_DIR
    #[arg(long, global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a compressed backup of the configured database
    Create {
        /// Skip the retention sweep that normally follows a backup
        #[arg(long)]
        no_sweep: bool,
    },

    /// List backup artifacts, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check an artifact's size, container and checksum
    Verify {
        /// Artifact path
        artifact: PathBuf,
    },

    /// Restore a backup into the configured (or given) database
    Restore {
        /// Position in the `list` output, starting at 1
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
        select: Option<u32>,

        /// Restore into this database instead of DB_NAME
        #[arg(short, long)]
        target: Option<String>,

        /// Answer every confirmation with yes
        #[arg(short, long)]
        yes: bool,
    },

    /// Drop and recreate the database, optionally loading a schema file
    Reset {
        /// SQL file (plain or .gz) to load after recreating
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Answer every confirmation with yes
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete artifacts older than the retention window
    Sweep {
        /// Override BACKUP_RETENTION_DAYS
        #[arg(long)]
        max_age_days: Option<u32>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Check that the database server is reachable
    Probe,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// View configuration
    View,

    /// Validate configuration
    Validate,
}
