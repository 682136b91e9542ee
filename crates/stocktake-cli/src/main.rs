use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use stocktake_core::{RepairOptions, DEFAULT_BATCH_SIZE};
use stocktake_store_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "stk.v1";

#[derive(Debug, Parser)]
#[command(name = "stk")]
#[command(about = "Stocktake inventory database repair CLI")]
struct Cli {
    #[arg(long, default_value = "./stocktake.sqlite3")]
    db: PathBuf,

    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Templates {
        #[command(subcommand)]
        command: TemplatesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TemplatesCommand {
    /// List test results whose template belongs to a part outside their ancestry.
    Check,
    /// Repoint or clone templates until every test result is consistent.
    Repair(TemplatesRepairArgs),
}

#[derive(Debug, Args)]
struct TemplatesRepairArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = parse_batch_size)]
    batch_size: usize,
    /// Write a SQLite backup here before touching any rows.
    #[arg(long)]
    backup: Option<PathBuf>,
}

fn parse_batch_size(raw: &str) -> Result<usize, String> {
    let value = raw.parse::<usize>().map_err(|err| format!("invalid batch size {raw}: {err}"))?;
    if value == 0 {
        return Err("batch size MUST be >= 1".to_string());
    }
    Ok(value)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdout stays a single JSON document.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Templates { command } => run_templates(command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    tracing::info!(
        from = before.current_version,
        to = after.current_version,
        "schema migrations applied"
    );
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &SqliteStore) -> Result<()> {
    let summary = store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup": summary,
        "status": "ok"
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_templates(command: TemplatesCommand, store: &mut SqliteStore) -> Result<()> {
    store.require_inventory_schema()?;
    match command {
        TemplatesCommand::Check => {
            let bad = store.bad_test_results()?;
            emit_json(serde_json::json!({
                "bad_results": bad.len(),
                "results": bad
            }))
        }
        TemplatesCommand::Repair(args) => run_templates_repair(&args, store),
    }
}

fn run_templates_repair(args: &TemplatesRepairArgs, store: &mut SqliteStore) -> Result<()> {
    let backup = match args.backup.as_ref() {
        Some(path) => {
            let summary = store.backup_database(path)?;
            tracing::info!(path = %summary.path, sha256 = %summary.sha256, "pre-repair backup written");
            Some(summary)
        }
        None => None,
    };

    let options = RepairOptions { dry_run: args.dry_run, batch_size: args.batch_size };
    let report = store.repair_test_templates(&options)?;

    emit_json(serde_json::json!({
        "report": report,
        "backup": backup
    }))
}
