use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fsic_registry_api::{RegistryApi, RenewRequest};
use fsic_registry_core::{HistoryAction, InspectionRecord, RecordId};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "fsr")]
#[command(about = "Fire-safety inspection registry CLI")]
struct Cli {
    #[arg(long, default_value = "./fsic_registry.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Renew(RenewArgs),
    CloseMonth(CloseMonthArgs),
    Renewed {
        #[command(subcommand)]
        command: Box<RenewedCommand>,
    },
    History(HistoryArgs),
    Archive {
        #[command(subcommand)]
        command: Box<ArchiveCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
    List,
    Delete(RecordDeleteArgs),
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    /// Record as camelCase JSON; missing fields default to empty strings.
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct RecordDeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct RenewArgs {
    #[arg(long)]
    old_record_json: String,
    #[arg(long)]
    updated_record_json: String,
    #[arg(long)]
    entity_key: Option<String>,
    /// Origin label stored on the PREVIOUS snapshot; defaults to "Unknown".
    #[arg(long)]
    source: Option<String>,
}

#[derive(Debug, Args)]
struct CloseMonthArgs {
    /// Archive bucket in YYYY-MM form; defaults to the current UTC month.
    #[arg(long)]
    month: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RenewedCommand {
    Latest(RenewedLatestArgs),
    List,
    Delete(RenewedDeleteArgs),
}

#[derive(Debug, Args)]
struct RenewedLatestArgs {
    #[arg(long)]
    entity_key: String,
}

#[derive(Debug, Args)]
struct RenewedDeleteArgs {
    #[arg(long)]
    record_id: String,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    entity_key: Option<String>,
    #[arg(long, value_enum)]
    action: Option<ActionArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActionArg {
    Previous,
    Renewed,
}

impl From<ActionArg> for HistoryAction {
    fn from(value: ActionArg) -> Self {
        match value {
            ActionArg::Previous => Self::Previous,
            ActionArg::Renewed => Self::Renewed,
        }
    }
}

#[derive(Debug, Subcommand)]
enum ArchiveCommand {
    Months,
    List(ArchiveListArgs),
    Export(ArchiveListArgs),
    Delete(ArchiveDeleteArgs),
}

#[derive(Debug, Args)]
struct ArchiveListArgs {
    #[arg(long)]
    month: String,
}

#[derive(Debug, Args)]
struct ArchiveDeleteArgs {
    #[arg(long)]
    month: String,
    #[arg(long)]
    id: String,
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

fn parse_record_json(raw: &str) -> Result<InspectionRecord> {
    serde_json::from_str(raw).context("failed to parse record JSON")
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    RecordId::parse(raw).ok_or_else(|| anyhow!("invalid record id: {raw}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = RegistryApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Record { command } => run_record(*command, &api),
        Command::Renew(args) => run_renew(&args, &api),
        Command::CloseMonth(args) => run_close_month(args, &api),
        Command::Renewed { command } => run_renewed(*command, &api),
        Command::History(args) => run_history(&args, &api),
        Command::Archive { command } => run_archive(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &RegistryApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(args.out.clone())?;
            emit_json(serde_json::json!({
                "out": args.out.display().to_string(),
                "manifest": serde_json::to_value(manifest)?
            }))
        }
        DbCommand::Import(args) => {
            let summary = api.import_snapshot(args.input, args.skip_existing)?;
            emit_json(serde_json::to_value(summary)?)
        }
        DbCommand::Backup(args) => {
            api.backup_database(args.out.clone())?;
            emit_json(serde_json::json!({
                "backed_up": true,
                "out": args.out.display().to_string()
            }))
        }
        DbCommand::Restore(args) => {
            api.restore_database(args.input.clone())?;
            emit_json(serde_json::json!({
                "restored": true,
                "in": args.input.display().to_string()
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_record(command: RecordCommand, api: &RegistryApi) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            let record = api.add_record(parse_record_json(&args.json)?)?;
            emit_json(serde_json::to_value(record)?)
        }
        RecordCommand::List => {
            let records = api.list_current()?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "records": serde_json::to_value(records)?
            }))
        }
        RecordCommand::Delete(args) => {
            let result = api.delete_current(&parse_record_id(&args.id)?)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_renew(args: &RenewArgs, api: &RegistryApi) -> Result<()> {
    let result = api.renew(RenewRequest {
        old_record: parse_record_json(&args.old_record_json)?,
        updated_record: parse_record_json(&args.updated_record_json)?,
        entity_key: args.entity_key.clone(),
        source: args.source.clone(),
    })?;
    emit_json(serde_json::to_value(result)?)
}

fn run_close_month(args: CloseMonthArgs, api: &RegistryApi) -> Result<()> {
    let result = api.close_month(args.month)?;
    emit_json(serde_json::to_value(result)?)
}

fn run_renewed(command: RenewedCommand, api: &RegistryApi) -> Result<()> {
    match command {
        RenewedCommand::Latest(args) => {
            let record = api.latest_renewed(&args.entity_key)?;
            emit_json(serde_json::json!({
                "entity_key": args.entity_key,
                "record": serde_json::to_value(record)?
            }))
        }
        RenewedCommand::List => {
            let records = api.list_all_renewed()?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "records": serde_json::to_value(records)?
            }))
        }
        RenewedCommand::Delete(args) => {
            let result = api.delete_renewed(&parse_record_id(&args.record_id)?)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_history(args: &HistoryArgs, api: &RegistryApi) -> Result<()> {
    let events =
        api.list_history(args.entity_key.as_deref(), args.action.map(HistoryAction::from))?;
    emit_json(serde_json::json!({
        "count": events.len(),
        "events": serde_json::to_value(events)?
    }))
}

fn run_archive(command: ArchiveCommand, api: &RegistryApi) -> Result<()> {
    match command {
        ArchiveCommand::Months => {
            let months = api.archive_months()?;
            emit_json(serde_json::json!({
                "count": months.len(),
                "months": months
            }))
        }
        ArchiveCommand::List(args) => {
            let records = api.list_archive(&args.month)?;
            emit_json(serde_json::json!({
                "month": args.month,
                "count": records.len(),
                "records": serde_json::to_value(records)?
            }))
        }
        ArchiveCommand::Export(args) => {
            let records = api.export_month(&args.month)?;
            emit_json(serde_json::json!({
                "month": args.month,
                "count": records.len(),
                "records": serde_json::to_value(records)?
            }))
        }
        ArchiveCommand::Delete(args) => {
            let result = api.delete_archived(&args.month, &parse_record_id(&args.id)?)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}
