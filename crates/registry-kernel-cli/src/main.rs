mod snapshot;

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use registry_kernel_api::{
    AmendRequest, ApiError, DelegateRequest, InscribeRequest, RegistryKernelApi,
};
use registry_kernel_core::{AmendmentPathway, InscriptionPathway, RecordId, RecordTable};
use registry_kernel_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use snapshot::{SnapshotKey, SnapshotSeal};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Registry Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./registry_kernel.sqlite3")]
    db: PathBuf,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_filter: String,

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
    Delegation {
        #[command(subcommand)]
        command: Box<DelegationCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
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
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
    #[arg(long)]
    encrypt_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Fail with `duplicate_entry` instead of skipping records already in the ledger.
    #[arg(long, default_value_t = false)]
    no_skip_existing: bool,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long)]
    decrypt_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
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
    Inscribe(InscribeArgs),
    Amend(AmendArgs),
    Show(RecordShowArgs),
}

/// Exactly one of `--seal` or `--seal-file`.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SealArgs {
    #[arg(long)]
    seal: Option<String>,
    /// Derive the seal as the SHA-256 hex digest of this file.
    #[arg(long)]
    seal_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InscribeArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    designation: String,
    #[command(flatten)]
    seal: SealArgs,
    #[arg(long)]
    descriptor: String,
    #[arg(long)]
    classification: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum, default_value_t = InscribePathwayArg::Canonical)]
    pathway: InscribePathwayArg,
    #[arg(long)]
    height: Option<u64>,
}

#[derive(Debug, Args)]
struct AmendArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    id: u64,
    #[arg(long)]
    designation: String,
    #[command(flatten)]
    seal: SealArgs,
    #[arg(long)]
    descriptor: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum, default_value_t = AmendPathwayArg::Canonical)]
    pathway: AmendPathwayArg,
    #[arg(long)]
    height: Option<u64>,
}

#[derive(Debug, Args)]
struct RecordShowArgs {
    #[arg(long)]
    id: u64,
    #[arg(long, value_enum, default_value_t = TableArg::Primary)]
    table: TableArg,
}

#[derive(Debug, Subcommand)]
enum DelegationCommand {
    Grant(GrantArgs),
    Show(GrantShowArgs),
    Check(AccessCheckArgs),
}

#[derive(Debug, Args)]
struct GrantArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    id: u64,
    #[arg(long)]
    recipient: String,
    /// One of baseline, enhanced, sovereign; anything else is rejected by the registry.
    #[arg(long)]
    clearance: String,
    #[arg(long)]
    span: u64,
    #[arg(long, default_value_t = false)]
    mutation_permitted: bool,
    #[arg(long)]
    height: Option<u64>,
}

#[derive(Debug, Args)]
struct GrantShowArgs {
    #[arg(long)]
    id: u64,
    #[arg(long)]
    recipient: String,
}

#[derive(Debug, Args)]
struct AccessCheckArgs {
    #[arg(long)]
    id: u64,
    #[arg(long)]
    principal: String,
    #[arg(long)]
    at_height: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InscribePathwayArg {
    Canonical,
    Optimized,
    Fortified,
    Secondary,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AmendPathwayArg {
    Canonical,
    Optimized,
    Fortified,
    Unchecked,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TableArg {
    Primary,
    Optimized,
}

/// Every stdout document is the command payload with `contract_version` added
/// at the top level. Payloads must serialize as JSON objects.
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    contract_version: &'static str,
    #[serde(flatten)]
    payload: &'a T,
}

fn emit<T: Serialize>(payload: &T) -> Result<()> {
    let envelope = Envelope { contract_version: CLI_CONTRACT_VERSION, payload };
    let body = serde_json::to_string_pretty(&envelope).context("failed to serialize command output")?;
    println!("{body}");
    Ok(())
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter)
            .with_context(|| format!("invalid log filter `{filter}`"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Record { command } => run_record(*command, &RegistryKernelApi::new(cli.db)),
        Command::Delegation { command } => {
            run_delegation(*command, &RegistryKernelApi::new(cli.db))
        }
        Command::Ledger { command } => run_ledger(&command, &RegistryKernelApi::new(cli.db)),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit(&json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit(&json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit(&json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    let signing_key = args.signing_key_file.as_deref().map(SnapshotKey::from_hex_file).transpose()?;
    let encryption_key =
        args.encrypt_key_file.as_deref().map(SnapshotKey::from_hex_file).transpose()?;

    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    let seal =
        snapshot::seal_snapshot(&args.out, &manifest, signing_key.as_ref(), encryption_key.as_ref())?;
    let signed = seal.as_ref().is_some_and(SnapshotSeal::is_signed);
    let encrypted = seal.as_ref().is_some_and(SnapshotSeal::is_encrypted);

    info!(
        out_dir = %args.out.display(),
        snapshot_id = %manifest.snapshot_id,
        last_record_id = manifest.last_record_id.0,
        ledger_height = manifest.ledger_height.0,
        signed,
        encrypted,
        "exported registry snapshot"
    );
    emit(&json!({
        "out_dir": args.out,
        "signed": signed,
        "encrypted": encrypted,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let verify_key = args.verify_key_file.as_deref().map(SnapshotKey::from_hex_file).transpose()?;
    let decrypt_key =
        args.decrypt_key_file.as_deref().map(SnapshotKey::from_hex_file).transpose()?;
    let skip_existing = !args.no_skip_existing;

    let opened = snapshot::open_snapshot(
        &args.input,
        verify_key.as_ref(),
        decrypt_key.as_ref(),
        args.allow_unsigned,
        &std::env::temp_dir(),
    )?;
    let summary = store.import_snapshot(opened.dir(), skip_existing)?;
    emit(&json!({
        "in_dir": args.input,
        "skip_existing": skip_existing,
        "decrypted": opened.decrypted(),
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit(&json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    let ledger = store.ledger_status()?;
    emit(&json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "last_record_id": ledger.last_record_id,
        "ledger_height": ledger.ledger_height
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit(&report)
}

fn run_record(command: RecordCommand, api: &RegistryKernelApi) -> Result<()> {
    match command {
        RecordCommand::Inscribe(args) => {
            let seal = args.seal.resolve()?;
            let receipt = api
                .inscribe(InscribeRequest {
                    actor: args.actor,
                    pathway: args.pathway.into_pathway(),
                    designation: args.designation,
                    seal,
                    descriptor: args.descriptor,
                    classification: args.classification,
                    taxonomy: args.tags,
                    height: args.height,
                })
                .map_err(rejection)?;
            emit(&receipt)
        }
        RecordCommand::Amend(args) => {
            let seal = args.seal.resolve()?;
            let receipt = api
                .amend(AmendRequest {
                    actor: args.actor,
                    record_id: RecordId(args.id),
                    pathway: args.pathway.into_pathway(),
                    designation: args.designation,
                    seal,
                    descriptor: args.descriptor,
                    taxonomy: args.tags,
                    height: args.height,
                })
                .map_err(rejection)?;
            emit(&receipt)
        }
        RecordCommand::Show(args) => {
            let record =
                api.record_show(args.table.into_table(), RecordId(args.id)).map_err(rejection)?;
            emit(&record)
        }
    }
}

fn run_delegation(command: DelegationCommand, api: &RegistryKernelApi) -> Result<()> {
    match command {
        DelegationCommand::Grant(args) => {
            let receipt = api
                .delegate(DelegateRequest {
                    actor: args.actor,
                    record_id: RecordId(args.id),
                    recipient: args.recipient,
                    clearance: args.clearance,
                    span: args.span,
                    mutation_permitted: args.mutation_permitted,
                    height: args.height,
                })
                .map_err(rejection)?;
            emit(&receipt)
        }
        DelegationCommand::Show(args) => {
            let lookup = api.grant_show(RecordId(args.id), &args.recipient).map_err(rejection)?;
            emit(&lookup)
        }
        DelegationCommand::Check(args) => {
            let check = api
                .access_check(RecordId(args.id), &args.principal, args.at_height)
                .map_err(rejection)?;
            emit(&check)
        }
    }
}

fn run_ledger(command: &LedgerCommand, api: &RegistryKernelApi) -> Result<()> {
    match command {
        LedgerCommand::Status => {
            let status = api.ledger_status().map_err(rejection)?;
            emit(&status)
        }
    }
}

fn rejection(err: ApiError) -> anyhow::Error {
    match err.kind() {
        Some(kind) => {
            debug!(error_kind = kind.as_str(), error_code = kind.code(), "registry call rejected");
            anyhow::Error::new(err).context(format!("registry rejected the call ({kind})"))
        }
        None => anyhow::Error::new(err),
    }
}

impl SealArgs {
    fn resolve(&self) -> Result<String> {
        if let Some(path) = self.seal_file.as_ref() {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read seal file {}", path.display()))?;
            return Ok(sha256_hex(&bytes));
        }
        self.seal.clone().ok_or_else(|| anyhow!("one of --seal or --seal-file is required"))
    }
}

impl InscribePathwayArg {
    fn into_pathway(self) -> InscriptionPathway {
        match self {
            Self::Canonical => InscriptionPathway::Canonical,
            Self::Optimized => InscriptionPathway::Optimized,
            Self::Fortified => InscriptionPathway::Fortified,
            Self::Secondary => InscriptionPathway::Secondary,
        }
    }
}

impl AmendPathwayArg {
    fn into_pathway(self) -> AmendmentPathway {
        match self {
            Self::Canonical => AmendmentPathway::Canonical,
            Self::Optimized => AmendmentPathway::Optimized,
            Self::Fortified => AmendmentPathway::Fortified,
            Self::Unchecked => AmendmentPathway::Unchecked,
        }
    }
}

impl TableArg {
    fn into_table(self) -> RecordTable {
        match self {
            Self::Primary => RecordTable::Primary,
            Self::Optimized => RecordTable::Optimized,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
