use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use records_kernel_api::{
    CreateDocumentRequest, CreateFilePlanRequest, CreateFolderRequest, CreateVersionRequest,
    DeclareRecordRequest, KernelConfig, RecordsKernelApi, UpdateDocumentRequest,
};
use records_kernel_core::{NodeRef, RecordableVersionPolicy, VersionRef, VersionType};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "RK_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Records Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./records_kernel.sqlite3")]
    db: PathBuf,

    /// YAML kernel configuration; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Principal the command acts as; the system principal when omitted.
    #[arg(long = "as", global = true)]
    principal: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Fileplan {
        #[command(subcommand)]
        command: FilePlanCommand,
    },
    Folder {
        #[command(subcommand)]
        command: FolderCommand,
    },
    Doc {
        #[command(subcommand)]
        command: Box<DocCommand>,
    },
    Version {
        #[command(subcommand)]
        command: VersionCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
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

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum FilePlanCommand {
    Create(FilePlanCreateArgs),
}

#[derive(Debug, Args)]
struct FilePlanCreateArgs {
    #[arg(long)]
    site: String,
    #[arg(long, default_value = "Records")]
    name: String,
}

#[derive(Debug, Subcommand)]
enum FolderCommand {
    Create(FolderCreateArgs),
}

#[derive(Debug, Args)]
struct FolderCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long, default_value_t = false)]
    record_folder: bool,
}

#[derive(Debug, Subcommand)]
enum DocCommand {
    Create(DocCreateArgs),
    Update(DocUpdateArgs),
    SetPolicy(DocSetPolicyArgs),
    Revert(DocRevertArgs),
    Delete(NodeArgs),
    Show(DocArgs),
}

#[derive(Debug, Args)]
struct DocCreateArgs {
    #[arg(long)]
    parent: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    content: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, default_value_t = false)]
    versionable: bool,
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
    #[arg(long)]
    file_plan: Option<String>,
    #[arg(long)]
    auto_version: Option<bool>,
}

#[derive(Debug, Args)]
struct DocUpdateArgs {
    #[arg(long)]
    doc: String,
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
struct DocSetPolicyArgs {
    #[arg(long)]
    doc: String,
    /// Omit to clear the policy.
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
}

#[derive(Debug, Args)]
struct DocRevertArgs {
    #[arg(long)]
    doc: String,
    #[arg(long)]
    version: String,
}

#[derive(Debug, Args)]
struct DocArgs {
    #[arg(long)]
    doc: String,
}

#[derive(Debug, Args)]
struct NodeArgs {
    #[arg(long)]
    node: String,
}

#[derive(Debug, Subcommand)]
enum VersionCommand {
    Create(VersionCreateArgs),
    History(DocArgs),
}

#[derive(Debug, Args)]
struct VersionCreateArgs {
    #[arg(long)]
    doc: String,
    #[arg(long = "type", value_enum)]
    version_type: Option<VersionTypeArg>,
    #[arg(long)]
    description: Option<String>,
    /// Overrides the document policy for this version only.
    #[arg(long)]
    recordable: Option<bool>,
    #[arg(long)]
    file_plan: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Declare(RecordDeclareArgs),
    DeclareDocument(RecordDeclareDocumentArgs),
    Destroy(RecordDestroyArgs),
    Delete(RecordArgs),
    Chain(RecordArgs),
    Show(RecordArgs),
    File(RecordFileArgs),
}

#[derive(Debug, Args)]
struct RecordDeclareArgs {
    #[arg(long)]
    doc: String,
    #[arg(long)]
    file_plan: Option<String>,
    #[arg(long, default_value_t = false)]
    force_new_version: bool,
}

#[derive(Debug, Args)]
struct RecordDeclareDocumentArgs {
    #[arg(long)]
    doc: String,
    #[arg(long)]
    file_plan: Option<String>,
}

#[derive(Debug, Args)]
struct RecordDestroyArgs {
    #[arg(long)]
    record: String,
    #[arg(long, default_value_t = false)]
    keep_metadata: bool,
}

#[derive(Debug, Args)]
struct RecordArgs {
    #[arg(long)]
    record: String,
}

#[derive(Debug, Args)]
struct RecordFileArgs {
    #[arg(long)]
    record: String,
    #[arg(long)]
    folder: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    None,
    MajorOnly,
    All,
}

impl From<PolicyArg> for RecordableVersionPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::None => Self::None,
            PolicyArg::MajorOnly => Self::MajorOnly,
            PolicyArg::All => Self::All,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VersionTypeArg {
    Major,
    Minor,
}

impl From<VersionTypeArg> for VersionType {
    fn from(value: VersionTypeArg) -> Self {
        match value {
            VersionTypeArg::Major => Self::Major,
            VersionTypeArg::Minor => Self::Minor,
        }
    }
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

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

/// `RK_LOG` wins over the configured filter; logs go to stderr so stdout stays JSON.
fn init_tracing(config: &KernelConfig) {
    let configured = config.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => KernelConfig::from_path(path)?,
        None => KernelConfig::default(),
    };
    init_tracing(&config);
    tracing::debug!("using database {}", cli.db.display());
    let api = RecordsKernelApi::new(cli.db, config);
    let principal = cli.principal.as_deref();
    match cli.command {
        Command::Db { command } => run_db(&api, command),
        Command::Fileplan { command } => run_file_plan(&api, command),
        Command::Folder { command } => run_folder(&api, command),
        Command::Doc { command } => run_doc(&api, *command, principal),
        Command::Version { command } => run_version(&api, command, principal),
        Command::Record { command } => run_record(&api, command, principal),
    }
}

fn run_db(api: &RecordsKernelApi, command: DbCommand) -> Result<()> {
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
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let status = api.restore(&args.input)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
    }
}

fn run_file_plan(api: &RecordsKernelApi, command: FilePlanCommand) -> Result<()> {
    match command {
        FilePlanCommand::Create(args) => emit(&api.create_file_plan(CreateFilePlanRequest {
            site_id: args.site,
            name: args.name,
        })?),
    }
}

fn run_folder(api: &RecordsKernelApi, command: FolderCommand) -> Result<()> {
    match command {
        FolderCommand::Create(args) => emit(&api.create_folder(CreateFolderRequest {
            parent: parse_optional_node_ref(args.parent.as_deref())?,
            name: args.name,
            record_folder: args.record_folder,
        })?),
    }
}

fn run_doc(api: &RecordsKernelApi, command: DocCommand, principal: Option<&str>) -> Result<()> {
    match command {
        DocCommand::Create(args) => emit(&api.create_document(CreateDocumentRequest {
            parent: parse_node_ref(&args.parent)?,
            name: args.name,
            content: args.content,
            title: args.title,
            versionable: args.versionable,
            policy: args.policy.map(RecordableVersionPolicy::from),
            file_plan: parse_optional_node_ref(args.file_plan.as_deref())?,
            auto_version: args.auto_version,
            principal: principal.map(str::to_string),
        })?),
        DocCommand::Update(args) => emit(&api.update_document(UpdateDocumentRequest {
            document: parse_node_ref(&args.doc)?,
            content: args.content,
            principal: principal.map(str::to_string),
        })?),
        DocCommand::SetPolicy(args) => emit(&api.set_policy(
            parse_node_ref(&args.doc)?,
            args.policy.map(RecordableVersionPolicy::from),
            principal,
        )?),
        DocCommand::Revert(args) => emit(&api.revert(
            parse_node_ref(&args.doc)?,
            parse_version_ref(&args.version)?,
            principal,
        )?),
        DocCommand::Delete(args) => {
            emit(&api.delete_node(parse_node_ref(&args.node)?, principal)?)
        }
        DocCommand::Show(args) => emit(&api.show_document(parse_node_ref(&args.doc)?)?),
    }
}

fn run_version(
    api: &RecordsKernelApi,
    command: VersionCommand,
    principal: Option<&str>,
) -> Result<()> {
    match command {
        VersionCommand::Create(args) => emit(&api.create_version(CreateVersionRequest {
            document: parse_node_ref(&args.doc)?,
            version_type: args.version_type.map(VersionType::from),
            description: args.description,
            recordable: args.recordable,
            file_plan: parse_optional_node_ref(args.file_plan.as_deref())?,
            principal: principal.map(str::to_string),
        })?),
        VersionCommand::History(args) => {
            let document = parse_node_ref(&args.doc)?;
            let versions = api.version_history(document)?;
            emit_json(serde_json::json!({
                "document": document,
                "versions": versions
            }))
        }
    }
}

fn run_record(
    api: &RecordsKernelApi,
    command: RecordCommand,
    principal: Option<&str>,
) -> Result<()> {
    match command {
        RecordCommand::Declare(args) => emit(&api.declare_record(DeclareRecordRequest {
            document: parse_node_ref(&args.doc)?,
            file_plan: parse_optional_node_ref(args.file_plan.as_deref())?,
            force_new_version: args.force_new_version,
            principal: principal.map(str::to_string),
        })?),
        RecordCommand::DeclareDocument(args) => emit(&api.declare_document_as_record(
            parse_node_ref(&args.doc)?,
            parse_optional_node_ref(args.file_plan.as_deref())?,
            principal,
        )?),
        RecordCommand::Destroy(args) => emit(&api.destroy_record(
            parse_node_ref(&args.record)?,
            args.keep_metadata,
            principal,
        )?),
        RecordCommand::Delete(args) => {
            emit(&api.delete_node(parse_node_ref(&args.record)?, principal)?)
        }
        RecordCommand::Chain(args) => {
            let record = parse_node_ref(&args.record)?;
            let chain = api.record_chain(record, principal)?;
            emit_json(serde_json::json!({
                "record": record,
                "chain": chain
            }))
        }
        RecordCommand::Show(args) => {
            emit(&api.show_record(parse_node_ref(&args.record)?, principal)?)
        }
        RecordCommand::File(args) => emit(&api.file_record(
            parse_node_ref(&args.record)?,
            parse_node_ref(&args.folder)?,
            principal,
        )?),
    }
}

fn parse_node_ref(value: &str) -> Result<NodeRef> {
    NodeRef::from_str(value).with_context(|| format!("invalid ULID for node: {value}"))
}

fn parse_optional_node_ref(value: Option<&str>) -> Result<Option<NodeRef>> {
    value.map(parse_node_ref).transpose()
}

fn parse_version_ref(value: &str) -> Result<VersionRef> {
    VersionRef::from_str(value).with_context(|| format!("invalid ULID for version: {value}"))
}
