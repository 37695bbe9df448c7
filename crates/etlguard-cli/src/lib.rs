//! Operator command surface for the warehouse safety store.
//!
//! Host processes can embed behavior through [`run_cli`] for full parsed
//! execution or [`run_command`] against an already-open store.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ulid::Ulid;

use etlguard_core::{
    days, parse_rfc3339_utc, AuditAction, AuditFilter, AuditLogInput, AuditOutcome,
    QuarantineFilter, QuarantineStatus, SyncStatus,
};
use etlguard_store_sqlite::{QueryContext, SqliteWarehouse};

#[derive(Debug, Parser)]
#[command(name = "etlguard")]
#[command(about = "Warehouse ingestion safety CLI")]
pub struct Cli {
    #[arg(long, default_value = "./etlguard.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Sync {
        #[command(subcommand)]
        command: Box<SyncCommand>,
    },
    Quarantine {
        #[command(subcommand)]
        command: Box<QuarantineCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
    Query(QueryArgs),
}

#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    Status(SyncKeyArgs),
    List(SyncListArgs),
    Stale(SyncStaleArgs),
    Reset(SyncResetArgs),
    Stats,
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
pub struct SyncKeyArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    entity: String,
}

#[derive(Debug, Args)]
pub struct SyncListArgs {
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    status: Option<SyncStatusArg>,
}

#[derive(Debug, Args)]
pub struct SyncStaleArgs {
    #[arg(long, default_value_t = 60)]
    running_for_minutes: i64,
}

#[derive(Debug, Args)]
pub struct SyncResetArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    entity: String,
    #[arg(long = "by")]
    resolved_by: String,
    #[arg(long, default_value = "ops")]
    tenant: String,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    #[arg(long, default_value_t = 90)]
    older_than_days: i64,
}

#[derive(Debug, Subcommand)]
pub enum QuarantineCommand {
    List(QuarantineListArgs),
    Show(RecordIdArgs),
    Retriable(RetriableArgs),
    Retry(RecordIdArgs),
    Resolve(ResolveArgs),
    Dismiss(DismissArgs),
    Requeue(RecordIdArgs),
    Delete(RecordIdArgs),
    Stats(QuarantineStatsArgs),
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
pub struct QuarantineListArgs {
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    status: Option<QuarantineStatusArg>,
    #[arg(long)]
    batch_id: Option<String>,
    #[arg(long)]
    error_code: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Args)]
pub struct RecordIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct RetriableArgs {
    #[arg(long)]
    source: String,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[arg(long = "id")]
    ids: Vec<String>,
    #[arg(long = "by")]
    resolved_by: String,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long, default_value = "ops")]
    tenant: String,
}

#[derive(Debug, Args)]
pub struct DismissArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "by")]
    resolved_by: String,
    #[arg(long, default_value = "ops")]
    tenant: String,
}

#[derive(Debug, Args)]
pub struct QuarantineStatsArgs {
    #[arg(long)]
    source: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Actor(AuditListArgs),
    Tenant(AuditListArgs),
}

#[derive(Debug, Args)]
pub struct AuditListArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "action")]
    actions: Vec<AuditActionArg>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    resource_type: Option<String>,
    #[arg(long)]
    resource_id: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[arg(long)]
    sql: String,
    #[arg(long, default_value = "cli")]
    actor: String,
    #[arg(long, default_value = "ops")]
    tenant: String,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    agent: Option<String>,
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    one: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SyncStatusArg {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QuarantineStatusArg {
    Pending,
    Retrying,
    Resolved,
    Ignored,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AuditActionArg {
    QuerySubmit,
    SqlExecute,
    QueryError,
    SyncStart,
    SyncComplete,
    SyncFail,
    SyncReset,
    RecordQuarantined,
    QuarantineResolve,
    ApprovalGate,
    DocumentAction,
    DataAccess,
}

#[derive(Debug, serde::Serialize)]
struct Listing<T: serde::Serialize> {
    total: u64,
    items: Vec<T>,
}

/// Executes the parsed top-level command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteWarehouse::open(&cli.db)?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation or the store operation fails.
pub fn run_command(command: Command, store: &mut SqliteWarehouse) -> Result<()> {
    match command {
        Command::Sync { command } => run_sync(*command, store),
        Command::Quarantine { command } => run_quarantine(*command, store),
        Command::Audit { command } => run_audit(*command, store),
        Command::Query(args) => run_query(args, store),
    }
}

fn run_sync(command: SyncCommand, store: &mut SqliteWarehouse) -> Result<()> {
    match command {
        SyncCommand::Status(args) => {
            let state = store.get_state(&args.source, &args.entity)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        SyncCommand::List(args) => {
            let states = store.list_states(args.source.as_deref(), args.status.map(map_sync_status))?;
            println!("{}", serde_json::to_string_pretty(&states)?);
            Ok(())
        }
        SyncCommand::Stale(args) => {
            let stale = store.list_stale(time::Duration::minutes(args.running_for_minutes))?;
            println!("{}", serde_json::to_string_pretty(&stale)?);
            Ok(())
        }
        SyncCommand::Reset(args) => {
            store.reset(&args.source, &args.entity)?;
            let mut audit = AuditLogInput::new(
                &args.resolved_by,
                &args.tenant,
                AuditAction::SyncReset,
                AuditOutcome::Success,
            );
            audit.resource_type = Some("etl_state".to_owned());
            audit.resource_id = Some(format!("{}/{}", args.source, args.entity));
            store.record_audit(&audit)?;
            let state = store.get_state(&args.source, &args.entity)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        SyncCommand::Stats => {
            let stats = store.sync_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        SyncCommand::Cleanup(args) => {
            let removed = store.cleanup_old_states(days(args.older_than_days))?;
            println!("{}", serde_json::json!({ "removed": removed }));
            Ok(())
        }
    }
}

fn run_quarantine(command: QuarantineCommand, store: &mut SqliteWarehouse) -> Result<()> {
    match command {
        QuarantineCommand::List(args) => {
            let filter = QuarantineFilter {
                source: args.source,
                status: args.status.map(map_quarantine_status),
                batch_id: args.batch_id.as_deref().map(parse_record_id).transpose()?,
                error_code: args.error_code,
                older_than: None,
                limit: Some(args.limit),
                offset: Some(args.offset),
            };
            let (records, total) = store.list_quarantined(&filter)?;
            let listing = Listing {
                total,
                items: records,
            };
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        QuarantineCommand::Show(args) => {
            let record = store.get_quarantined(parse_record_id(&args.id)?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        QuarantineCommand::Retriable(args) => {
            let records = store.get_retriable(&args.source, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        QuarantineCommand::Retry(args) => {
            let record = store.increment_retry(parse_record_id(&args.id)?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        QuarantineCommand::Resolve(args) => {
            if args.ids.is_empty() {
                return Err(anyhow!("at least one --id is required"));
            }
            let ids = args
                .ids
                .iter()
                .map(|raw| parse_record_id(raw))
                .collect::<Result<Vec<_>>>()?;
            let transitioned = if let [only] = ids.as_slice() {
                store.resolve_quarantined(*only, &args.resolved_by, args.notes.as_deref())?;
                1
            } else {
                store.resolve_quarantined_batch(&ids, &args.resolved_by, args.notes.as_deref())?
            };
            for id in &ids {
                let mut audit = AuditLogInput::new(
                    &args.resolved_by,
                    &args.tenant,
                    AuditAction::QuarantineResolve,
                    AuditOutcome::Success,
                );
                audit.resource_type = Some("etl_quarantine".to_owned());
                audit.resource_id = Some(id.to_string());
                store.record_audit(&audit)?;
            }
            println!("{}", serde_json::json!({ "resolved": transitioned }));
            Ok(())
        }
        QuarantineCommand::Dismiss(args) => {
            let id = parse_record_id(&args.id)?;
            store.dismiss_quarantined(id, &args.resolved_by)?;
            let mut audit = AuditLogInput::new(
                &args.resolved_by,
                &args.tenant,
                AuditAction::QuarantineResolve,
                AuditOutcome::Success,
            );
            audit.resource_type = Some("etl_quarantine".to_owned());
            audit.resource_id = Some(id.to_string());
            store.record_audit(&audit)?;
            println!("{}", serde_json::json!({ "dismissed": args.id }));
            Ok(())
        }
        QuarantineCommand::Requeue(args) => {
            let id = parse_record_id(&args.id)?;
            store.requeue_quarantined(id)?;
            let record = store.get_quarantined(id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        QuarantineCommand::Delete(args) => {
            store.delete_quarantined(parse_record_id(&args.id)?)?;
            println!("{}", serde_json::json!({ "deleted": args.id }));
            Ok(())
        }
        QuarantineCommand::Stats(args) => {
            let stats = store.quarantine_stats(args.source.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        QuarantineCommand::Cleanup(args) => {
            let removed = store.cleanup_quarantine(days(args.older_than_days))?;
            println!("{}", serde_json::json!({ "removed": removed }));
            Ok(())
        }
    }
}

fn run_audit(command: AuditCommand, store: &SqliteWarehouse) -> Result<()> {
    match command {
        AuditCommand::Actor(args) => {
            let filter = build_audit_filter(&args)?;
            let (entries, total) = store.audit_for_actor(&args.id, &filter)?;
            let listing = Listing {
                total,
                items: entries,
            };
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        AuditCommand::Tenant(args) => {
            let filter = build_audit_filter(&args)?;
            let (entries, total) = store.audit_for_tenant(&args.id, &filter)?;
            let listing = Listing {
                total,
                items: entries,
            };
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
    }
}

fn run_query(args: QueryArgs, store: &SqliteWarehouse) -> Result<()> {
    let mut ctx = QueryContext::new(&args.actor, &args.tenant);
    ctx.session_id = args.session;
    ctx.agent = args.agent;
    ctx.request_id = args.request_id;
    if args.one {
        let rows = store.execute_query_audited(&args.sql, &ctx)?;
        let first = rows.into_iter().next();
        println!("{}", serde_json::to_string_pretty(&first)?);
    } else {
        let rows = store.execute_query_audited(&args.sql, &ctx)?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

fn build_audit_filter(args: &AuditListArgs) -> Result<AuditFilter> {
    Ok(AuditFilter {
        actions: args.actions.iter().copied().map(map_audit_action).collect(),
        from: args.from.as_deref().map(parse_timestamp).transpose()?,
        to: args.to.as_deref().map(parse_timestamp).transpose()?,
        resource_type: args.resource_type.clone(),
        resource_id: args.resource_id.clone(),
        limit: Some(args.limit),
        offset: Some(args.offset),
    })
}

fn parse_timestamp(raw: &str) -> Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn parse_record_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn map_sync_status(value: SyncStatusArg) -> SyncStatus {
    match value {
        SyncStatusArg::Idle => SyncStatus::Idle,
        SyncStatusArg::Running => SyncStatus::Running,
        SyncStatusArg::Completed => SyncStatus::Completed,
        SyncStatusArg::Failed => SyncStatus::Failed,
    }
}

fn map_quarantine_status(value: QuarantineStatusArg) -> QuarantineStatus {
    match value {
        QuarantineStatusArg::Pending => QuarantineStatus::Pending,
        QuarantineStatusArg::Retrying => QuarantineStatus::Retrying,
        QuarantineStatusArg::Resolved => QuarantineStatus::Resolved,
        QuarantineStatusArg::Ignored => QuarantineStatus::Ignored,
    }
}

fn map_audit_action(value: AuditActionArg) -> AuditAction {
    match value {
        AuditActionArg::QuerySubmit => AuditAction::QuerySubmit,
        AuditActionArg::SqlExecute => AuditAction::SqlExecute,
        AuditActionArg::QueryError => AuditAction::QueryError,
        AuditActionArg::SyncStart => AuditAction::SyncStart,
        AuditActionArg::SyncComplete => AuditAction::SyncComplete,
        AuditActionArg::SyncFail => AuditAction::SyncFail,
        AuditActionArg::SyncReset => AuditAction::SyncReset,
        AuditActionArg::RecordQuarantined => AuditAction::RecordQuarantined,
        AuditActionArg::QuarantineResolve => AuditAction::QuarantineResolve,
        AuditActionArg::ApprovalGate => AuditAction::ApprovalGate,
        AuditActionArg::DocumentAction => AuditAction::DocumentAction,
        AuditActionArg::DataAccess => AuditAction::DataAccess,
    }
}
