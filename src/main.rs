use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dbvault::cli::{Cli, Commands, ConfigCommands};
use dbvault::core::catalog;
use dbvault::core::config::{BackupSettings, ConnectionConfig};
use dbvault::core::confirm::Operator;
use dbvault::core::retention::SweepReport;
use dbvault::core::verify::Verdict;
use dbvault::core::{
    ArchiveWriter, BackupError, BackupKind, ConfigManager, ConnectionProbe, DatabaseEngine,
    DirectoryLock, IntegrityVerifier, MySqlEngine, ResetOrchestrator, RestoreOrchestrator,
    RetentionManager, RetentionPolicy,
};
use dbvault::prompt::{artifact_line, AssumeYes, TerminalOperator};
use dbvault::utils::{format_bytes, format_duration};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("{} {:#}", "✗".red().bold(), err);

        if let Some(backup_err) = err.downcast_ref::<BackupError>() {
            if let Some(hint) = backup_err.recovery_hint() {
                eprintln!("  {} {}", "→".cyan(), hint);
            }
            if backup_err.is_declined() {
                process::exit(2);
            }
        }
        process::exit(1);
    }
}

/// Logs go to stderr; `RUST_LOG` takes precedence over `-v`
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = ConfigManager::load_with_env(&cli.env_file)?;

    match cli.command {
        Commands::Config { command } => handle_config(&config, command),
        Commands::Verify { artifact } => handle_verify(&artifact),
        Commands::List { json } => {
            let settings = settings(&config, cli.backup_dir.as_deref())?;
            handle_list(&settings, json)
        }
        Commands::Sweep { max_age_days, dry_run } => {
            let settings = settings(&config, cli.backup_dir.as_deref())?;
            handle_sweep(&settings, max_age_days, dry_run)
        }
        Commands::Create { no_sweep } => {
            let session = Session::open(&config, cli.backup_dir.as_deref())?;
            handle_create(&session, no_sweep).await
        }
        Commands::Restore { select, target, yes } => {
            let session = Session::open(&config, cli.backup_dir.as_deref())?;
            handle_restore(&session, select, target, yes).await
        }
        Commands::Reset { schema, yes } => {
            let session = Session::open(&config, cli.backup_dir.as_deref())?;
            handle_reset(&session, schema, yes).await
        }
        Commands::Probe => {
            let session = Session::open(&config, cli.backup_dir.as_deref())?;
            handle_probe(&session).await
        }
    }
}

fn settings(config: &ConfigManager, backup_dir: Option<&Path>) -> Result<BackupSettings> {
    let mut settings = config.backup_settings()?;
    if let Some(dir) = backup_dir {
        settings.backup_dir = dir.to_path_buf();
    }
    Ok(settings)
}

/// Everything a command that talks to the database needs
struct Session {
    connection: ConnectionConfig,
    settings: BackupSettings,
    engine: Arc<dyn DatabaseEngine>,
}

impl Session {
    fn open(config: &ConfigManager, backup_dir: Option<&Path>) -> Result<Self> {
        let connection = config.connection()?;
        let settings = settings(config, backup_dir)?;
        tracing::debug!(?connection, backup_dir = %settings.backup_dir.display(), "configuration loaded");

        let engine: Arc<dyn DatabaseEngine> = Arc::new(
            MySqlEngine::new(connection.clone()).with_connect_timeout(settings.probe_timeout.as_secs()),
        );

        Ok(Self {
            connection,
            settings,
            engine,
        })
    }

    /// Fails with a connection error when the server does not answer
    async fn probe(&self) -> Result<Duration> {
        let probe = ConnectionProbe::new(self.engine.clone(), self.connection.target(), self.settings.probe_timeout);
        Ok(probe.require().await?)
    }

    fn writer(&self) -> ArchiveWriter {
        ArchiveWriter::new(self.engine.clone(), self.connection.metadata_context())
            .with_compression_level(self.settings.compression_level)
            .with_deadline(self.settings.deadline)
    }

    fn lock(&self) -> Result<DirectoryLock> {
        Ok(DirectoryLock::acquire(&self.settings.backup_dir)?)
    }
}

fn spinner(message: String) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner} {msg} ({elapsed})")?);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

async fn handle_create(session: &Session, no_sweep: bool) -> Result<()> {
    session.probe().await?;
    let _lock = session.lock()?;
    let database = &session.connection.database;

    let pb = spinner(format!("Backing up {}", database))?;
    let created = session
        .writer()
        .create(database, &session.settings.backup_dir, BackupKind::Manual)
        .await;
    pb.finish_and_clear();
    let created = created?;

    println!("{} Backup created", "✓".green().bold());
    println!("  File:     {}", created.artifact.path.display());
    println!(
        "  Size:     {} ({} uncompressed)",
        format_bytes(created.artifact.size_bytes),
        format_bytes(created.dump_bytes)
    );
    println!("  Checksum: {}", created.metadata.checksum);
    println!("  Took:     {}", format_duration(created.elapsed.as_secs()));

    if !no_sweep {
        let policy = &session.settings.retention;
        let manager = RetentionManager::new();
        for dir in session.settings.namespaces() {
            match manager.sweep(&dir, policy) {
                Ok(report) => print_sweep(&report, policy),
                Err(e) => {
                    tracing::warn!(directory = %dir.display(), error = %e, "retention sweep after backup failed");
                    println!("{} Sweep of {} skipped: {}", "⚠".yellow().bold(), dir.display(), e);
                }
            }
        }
    }

    Ok(())
}

fn handle_list(settings: &BackupSettings, json: bool) -> Result<()> {
    let artifacts = catalog::scan(&settings.backup_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&artifacts)?);
        return Ok(());
    }

    if artifacts.is_empty() {
        println!("No backups in {}", settings.backup_dir.display());
        return Ok(());
    }

    println!("Backups in {} (newest first):\n", settings.backup_dir.display());
    for (index, artifact) in artifacts.iter().enumerate() {
        println!("{}", artifact_line(index, artifact));
    }

    let reset_count = catalog::scan(&settings.reset_dir())?.len();
    if reset_count > 0 {
        println!("\n{} pre-reset snapshot(s) in {}", reset_count, settings.reset_dir().display());
    }

    Ok(())
}

fn handle_verify(artifact: &Path) -> Result<()> {
    let result = IntegrityVerifier::new()
        .verify_artifact(artifact)
        .with_context(|| format!("Failed to verify {}", artifact.display()))?;

    for warning in &result.warnings {
        println!("{} {}", "⚠".yellow().bold(), warning);
    }

    match &result.verdict {
        Verdict::Valid => {
            println!("{} {} is valid", "✓".green().bold(), artifact.display());
            if let Some(checksum) = &result.checksum {
                println!("  Checksum: {}", checksum);
            }
            Ok(())
        }
        Verdict::Invalid(reason) => Err(anyhow!("{} is invalid: {}", artifact.display(), reason)),
    }
}

async fn handle_restore(session: &Session, select: Option<u32>, target: Option<String>, yes: bool) -> Result<()> {
    session.probe().await?;
    let _lock = session.lock()?;

    let target = target.unwrap_or_else(|| session.connection.database.clone());
    let selection = select.map(|n| n as usize - 1);

    let mut operator: Box<dyn Operator> = if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalOperator::stdin())
    };

    let report = RestoreOrchestrator::new(
        session.engine.clone(),
        session.writer(),
        &session.settings.backup_dir,
        target,
    )
    .with_selection(selection)
    .with_deadline(session.settings.deadline)
    .run(operator.as_mut())
    .await?;

    println!("{} Restored {} into '{}'", "✓".green().bold(), report.artifact.display(), report.target_database);
    if let Some(source) = &report.renamed_from {
        println!("  Renamed from: {}", source);
    }
    println!("  Tables:       {}", report.table_count);
    match &report.pre_restore_snapshot {
        Some(path) => println!("  Snapshot:     {}", path.display()),
        None => println!("  Snapshot:     none (target did not exist or was skipped)"),
    }
    println!("  Took:         {}", format_duration(report.elapsed.as_secs()));

    Ok(())
}

async fn handle_reset(session: &Session, schema: Option<std::path::PathBuf>, yes: bool) -> Result<()> {
    session.probe().await?;
    let _lock = session.lock()?;

    let mut operator: Box<dyn Operator> = if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalOperator::stdin())
    };

    let report = ResetOrchestrator::new(
        session.engine.clone(),
        session.writer(),
        session.settings.reset_dir(),
        &session.connection.database,
    )
    .with_schema(schema)
    .with_deadline(session.settings.deadline)
    .run(operator.as_mut())
    .await?;

    println!("{} Database '{}' reset", "✓".green().bold(), report.target_database);
    if let Some(schema) = &report.schema {
        println!("  Schema:   {} ({} tables)", schema.display(), report.table_count);
    }
    if let Some(path) = &report.pre_reset_snapshot {
        println!("  Snapshot: {}", path.display());
    }

    Ok(())
}

fn handle_sweep(settings: &BackupSettings, max_age_days: Option<u32>, dry_run: bool) -> Result<()> {
    let policy = max_age_days.map(RetentionPolicy::new).unwrap_or(settings.retention);
    let _lock = DirectoryLock::acquire(&settings.backup_dir)?;

    let mut failed = 0;
    for (dir, outcome) in RetentionManager::new().sweep_each(&settings.namespaces(), &policy, SystemTime::now(), dry_run) {
        match outcome {
            Ok(report) => print_sweep(&report, &policy),
            Err(e) => {
                eprintln!("{} {}: {}", "✗".red().bold(), dir.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} backup director{} could not be swept", failed, if failed == 1 { "y" } else { "ies" }));
    }
    Ok(())
}

fn print_sweep(report: &SweepReport, policy: &RetentionPolicy) {
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };

    if report.deleted_count == 0 && report.orphans_removed.is_empty() && report.failures.is_empty() {
        println!(
            "{} {}: nothing older than {} days ({} kept)",
            "✓".green().bold(),
            report.directory.display(),
            policy.max_age_days,
            report.kept
        );
        return;
    }

    println!(
        "{} {}: {} {} artifact(s), {} freed, {} kept",
        "✓".green().bold(),
        report.directory.display(),
        verb,
        report.deleted_count,
        format_bytes(report.bytes_freed),
        report.kept
    );
    for path in &report.deleted {
        println!("  - {}", path.display());
    }
    for path in &report.orphans_removed {
        println!("  - {} (orphaned metadata)", path.display());
    }
    for failure in &report.failures {
        println!("{} could not delete {}: {}", "⚠".yellow().bold(), failure.path.display(), failure.error);
    }
}

async fn handle_probe(session: &Session) -> Result<()> {
    let latency = session.probe().await?;
    println!(
        "{} {} reachable in {} ms",
        "✓".green().bold(),
        session.connection.target(),
        latency.as_millis()
    );
    Ok(())
}

fn handle_config(config: &ConfigManager, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::View => {
            println!("Configuration ({}):\n", config.env_file().display());
            for key in config.keys() {
                if let Some(value) = config.display_value(&key) {
                    match config.comment(&key) {
                        Some(comment) => println!("{}: {}  {}", key, value, format!("# {}", comment).dimmed()),
                        None => println!("{}: {}", key, value),
                    }
                }
            }
        }
        ConfigCommands::Validate => {
            let errors = config.validate();

            if errors.is_empty() {
                println!("{} Configuration is valid", "✓".green().bold());
            } else {
                println!("{} Configuration errors:", "✗".red().bold());
                for error in &errors {
                    println!("  - {}", error);
                }
                return Err(anyhow!("{} configuration problem(s)", errors.len()));
            }
        }
    }

    Ok(())
}
