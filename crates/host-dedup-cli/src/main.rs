use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use host_dedup_core::{
    DuplicateResolver, EmitFailurePolicy, EventEmitter, HostDeleteEvent, HostId, RunSummary,
    StalenessClock, StalenessConfig, StalenessOffsets,
};
use host_dedup_events::{MqttEventSink, NdjsonEventSink};
use host_dedup_store_sqlite::SqliteHostStore;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{EventsConfig, LoadedConfig};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "hostdedup")]
#[command(about = "Duplicate host pruning for a multi-tenant host inventory")]
struct Cli {
    #[arg(long, default_value = "./host_inventory.sqlite3")]
    db: PathBuf,

    /// YAML job configuration; falls back to $HOST_DEDUP_CONFIG, then ./hostdedup.yaml.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Hosts {
        #[command(subcommand)]
        command: HostsCommand,
    },
    Staleness {
        #[command(subcommand)]
        command: StalenessCommand,
    },
    Dedup {
        #[command(subcommand)]
        command: DedupCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum HostsCommand {
    Import(HostsImportArgs),
    List(AccountFilterArgs),
    /// Lifecycle state of each host under the effective staleness offsets.
    Status(AccountFilterArgs),
}

#[derive(Debug, Args)]
struct HostsImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct AccountFilterArgs {
    #[arg(long)]
    account: Option<String>,
}

#[derive(Debug, Subcommand)]
enum StalenessCommand {
    Set(StalenessSetArgs),
    Show(AccountFilterArgs),
}

#[derive(Debug, Args)]
struct StalenessSetArgs {
    #[arg(long)]
    account: String,
    #[arg(long)]
    conventional_time_to_stale: Option<i64>,
    #[arg(long)]
    conventional_time_to_stale_warning: Option<i64>,
    #[arg(long)]
    conventional_time_to_delete: Option<i64>,
    #[arg(long)]
    immutable_time_to_stale: Option<i64>,
    #[arg(long)]
    immutable_time_to_stale_warning: Option<i64>,
    #[arg(long)]
    immutable_time_to_delete: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum DedupCommand {
    Run(DedupRunArgs),
}

#[derive(Debug, Args)]
struct DedupRunArgs {
    /// Resolve only this account.
    #[arg(long)]
    account: Option<String>,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Write delete events to this NDJSON file instead of the configured sink.
    #[arg(long)]
    events_out: Option<PathBuf>,
    #[arg(long, value_enum)]
    on_emit_failure: Option<EmitFailureArg>,
    #[arg(long, default_value_t = false)]
    exclude_culled: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitFailureArg {
    Continue,
    Abort,
}

impl EmitFailureArg {
    fn into_policy(self) -> EmitFailurePolicy {
        match self {
            Self::Continue => EmitFailurePolicy::Continue,
            Self::Abort => EmitFailurePolicy::Abort,
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteHostStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Hosts { command } => {
            let loaded = config::load(cli.config.as_deref())?;
            let mut store = SqliteHostStore::open(&cli.db)?;
            run_hosts(command, &mut store, &loaded)
        }
        Command::Staleness { command } => {
            let loaded = config::load(cli.config.as_deref())?;
            let mut store = SqliteHostStore::open(&cli.db)?;
            run_staleness(command, &mut store, &loaded)
        }
        Command::Dedup { command } => {
            let loaded = config::load(cli.config.as_deref())?;
            let mut store = SqliteHostStore::open(&cli.db)?;
            match command {
                DedupCommand::Run(args) => run_dedup(&args, &mut store, &loaded),
            }
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteHostStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteHostStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_hosts(
    command: HostsCommand,
    store: &mut SqliteHostStore,
    loaded: &LoadedConfig,
) -> Result<()> {
    store.migrate()?;
    match command {
        HostsCommand::Import(args) => {
            let summary = store.import_hosts(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_file": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        HostsCommand::List(args) => {
            let hosts = store.list_hosts(args.account.as_deref())?;
            emit_json(serde_json::json!({ "hosts": hosts }))
        }
        HostsCommand::Status(args) => {
            let clock = StalenessClock::new(loaded.config.staleness);
            let mut rows = Vec::new();
            for host in store.list_hosts(args.account.as_deref())? {
                let account_clock = match store.account_staleness(&host.account)? {
                    Some(entry) => clock.with_config(entry.staleness),
                    None => clock,
                };
                let timestamps = account_clock.timestamps(host.stale_timestamp, host.host_type);
                rows.push(serde_json::json!({
                    "id": host.id,
                    "account": host.account,
                    "host_type": host.host_type.as_str(),
                    "state": account_clock.state_of(host.stale_timestamp, host.host_type).as_str(),
                    "timestamps": timestamps
                }));
            }
            emit_json(serde_json::json!({
                "evaluated_at": rfc3339(clock.now())?,
                "hosts": rows
            }))
        }
    }
}

fn run_staleness(
    command: StalenessCommand,
    store: &mut SqliteHostStore,
    loaded: &LoadedConfig,
) -> Result<()> {
    store.migrate()?;
    match command {
        StalenessCommand::Set(args) => {
            let base = store
                .account_staleness(&args.account)?
                .map_or(loaded.config.staleness, |entry| entry.staleness);
            let config = StalenessConfig {
                conventional: StalenessOffsets::new(
                    args.conventional_time_to_stale.unwrap_or(base.conventional.time_to_stale),
                    args.conventional_time_to_stale_warning
                        .unwrap_or(base.conventional.time_to_stale_warning),
                    args.conventional_time_to_delete.unwrap_or(base.conventional.time_to_delete),
                ),
                immutable: StalenessOffsets::new(
                    args.immutable_time_to_stale.unwrap_or(base.immutable.time_to_stale),
                    args.immutable_time_to_stale_warning
                        .unwrap_or(base.immutable.time_to_stale_warning),
                    args.immutable_time_to_delete.unwrap_or(base.immutable.time_to_delete),
                ),
            };
            store.set_account_staleness(&args.account, &config)?;
            emit_json(serde_json::json!({
                "account": args.account,
                "staleness": config
            }))
        }
        StalenessCommand::Show(args) => {
            let entries = match args.account.as_deref() {
                Some(account) => store.account_staleness(account)?.into_iter().collect(),
                None => store.list_account_staleness()?,
            };
            emit_json(serde_json::json!({
                "defaults": loaded.config.staleness,
                "accounts": entries
            }))
        }
    }
}

/// The emitter chosen for a run, plus a description for the JSON report.
enum RunSink {
    Discard,
    Ndjson { sink: NdjsonEventSink<std::io::BufWriter<std::fs::File>>, path: PathBuf },
    Mqtt(MqttEventSink),
}

impl RunSink {
    fn open(args: &DedupRunArgs, events: &EventsConfig) -> Result<Self> {
        if args.dry_run {
            return Ok(Self::Discard);
        }
        if let Some(path) = &args.events_out {
            return Self::ndjson(path);
        }
        match events {
            EventsConfig::Ndjson { path } => Self::ndjson(path),
            EventsConfig::Mqtt(mqtt) => {
                MqttEventSink::connect(mqtt.clone()).map(Self::Mqtt).map_err(|err| anyhow!("{err}"))
            }
        }
    }

    fn ndjson(path: &std::path::Path) -> Result<Self> {
        let sink = NdjsonEventSink::create(path).map_err(|err| anyhow!("{err}"))?;
        Ok(Self::Ndjson { sink, path: path.to_path_buf() })
    }

    fn describe(&self) -> Value {
        match self {
            Self::Discard => serde_json::json!({ "sink": "none" }),
            Self::Ndjson { sink, path } => serde_json::json!({
                "sink": "ndjson",
                "path": path,
                "written": sink.written()
            }),
            Self::Mqtt(sink) => serde_json::json!({
                "sink": "mqtt",
                "published": sink.published()
            }),
        }
    }

    fn close(self) -> Result<()> {
        match self {
            Self::Mqtt(sink) => sink.close().map_err(|err| anyhow!("{err}")),
            Self::Discard | Self::Ndjson { .. } => Ok(()),
        }
    }
}

impl EventEmitter for RunSink {
    fn emit(
        &mut self,
        key: &HostId,
        event: &HostDeleteEvent,
    ) -> std::result::Result<(), host_dedup_core::DedupError> {
        match self {
            Self::Discard => Ok(()),
            Self::Ndjson { sink, .. } => sink.emit(key, event),
            Self::Mqtt(sink) => sink.emit(key, event),
        }
    }

    fn flush(&mut self) -> std::result::Result<(), host_dedup_core::DedupError> {
        match self {
            Self::Discard => Ok(()),
            Self::Ndjson { sink, .. } => sink.flush(),
            Self::Mqtt(sink) => sink.flush(),
        }
    }
}

fn run_dedup(args: &DedupRunArgs, store: &mut SqliteHostStore, loaded: &LoadedConfig) -> Result<()> {
    store.migrate()?;

    let mut options = loaded.config.resolver_options();
    if let Some(chunk_size) = args.chunk_size {
        options.chunk_size = chunk_size;
    }
    if let Some(policy) = args.on_emit_failure {
        options.emit_failure = policy.into_policy();
    }
    options.dry_run = args.dry_run;
    options.exclude_culled |= args.exclude_culled;

    let stop = Arc::new(AtomicBool::new(false));
    install_stop_signal(Arc::clone(&stop))?;

    let mut sink = RunSink::open(args, &loaded.config.events)?;
    let clock = StalenessClock::new(loaded.config.staleness);
    info!(
        config = ?loaded.source,
        chunk_size = options.chunk_size,
        emit_failure = options.emit_failure.as_str(),
        "starting dedup run"
    );

    let summary: RunSummary = {
        let store: &SqliteHostStore = store;
        let mut resolver = DuplicateResolver::new(store, &mut sink, &*stop, options, clock)
            .map_err(|err| anyhow!("{err}"))?;
        let outcome = match args.account.as_deref() {
            Some(account) => resolver.run_account(account),
            None => resolver.run(),
        };
        outcome.map_err(|err| anyhow!("{err}"))?
    };

    let events = sink.describe();
    sink.close()?;
    if summary.interrupted {
        warn!(deleted = summary.hosts_deleted, "dedup run interrupted");
    }
    emit_json(serde_json::json!({
        "summary": summary,
        "options": options,
        "events": events
    }))
}

/// Set `stop` on SIGINT or SIGTERM. The listener runs on its own thread with a
/// single-threaded runtime so the resolver itself stays synchronous.
fn install_stop_signal(stop: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    thread::Builder::new()
        .name("hostdedup-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                wait_for_shutdown().await;
                warn!("stop requested; finishing the current deletion");
                stop.store(true, Ordering::SeqCst);
            });
        })
        .context("failed to start signal thread")?;
    Ok(())
}

/// Resolve once `registration` reports a delivered signal. A registration
/// error means no signal can arrive, so it never resolves.
async fn signalled<F>(name: &str, registration: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = registration.await {
        warn!(signal = name, error = %err, "signal handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        let mut stream = signal(SignalKind::terminate())?;
        match stream.recv().await {
            Some(()) => std::io::Result::Ok(()),
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = signalled("SIGINT", tokio::signal::ctrl_c()) => {}
        () = signalled("SIGTERM", terminate) => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    signalled("ctrl-c", tokio::signal::ctrl_c()).await;
}

fn rfc3339(value: time::OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
