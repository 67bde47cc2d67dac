mod cli;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, GetArgs, IntervalArg, ListArgs, PutArgs, QueryArgs};
use mexsync::config::{Config, OperationPolicy};
use mexsync::exchange::ExchangeClient;
use mexsync::ops::{
    GetClient, GetContent, GetSelector, IntervalType, ListClient, ListQuery, ListWindow, PutClient,
    PutContent, QueryClient, QueryRequest,
};
use mexsync::signing::{Ed25519SignatureService, Identity};
use mexsync::sync::{FileWatermarkStore, LockManager, Scheduler, Sink, SyncEngine, WatermarkStore};
use mexsync::transport::HttpTransport;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "mexsync=info",
        1 => "mexsync=debug",
        _ => "mexsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything built from the configuration.
struct App {
    config: Config,
    exchange: Arc<ExchangeClient>,
    identity: Option<Identity>,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let identity = config.identity().context("Failed to load signing key")?;
        let trusted = config
            .trusted_certificates()
            .context("Failed to load trusted keys")?;
        if trusted.is_empty() {
            warn!("No trusted keys configured; every signed response will be rejected");
        }

        let transport = HttpTransport::new(&config.endpoint.url, config.endpoint.timeout())
            .context("Failed to create HTTPS client")?;
        let signer = Ed25519SignatureService::new(None, trusted);
        let exchange = ExchangeClient::new(Arc::new(transport), Arc::new(signer))
            .with_debug_messages(config.endpoint.debug_messages);

        Ok(Self {
            config,
            exchange: Arc::new(exchange),
            identity,
        })
    }

    fn get_client(&self) -> GetClient {
        let client = GetClient::new(Arc::clone(&self.exchange));
        let client = apply(client, self.config.operations.get, GetClient::with_policy);
        match &self.identity {
            Some(id) => client.with_identity(id.clone()),
            None => client,
        }
    }

    fn list_client(&self) -> ListClient {
        let client = ListClient::new(Arc::clone(&self.exchange));
        let client = apply(client, self.config.operations.list, ListClient::with_policy);
        match &self.identity {
            Some(id) => client.with_identity(id.clone()),
            None => client,
        }
    }

    fn put_client(&self) -> PutClient {
        let client = PutClient::new(Arc::clone(&self.exchange));
        let client = apply(client, self.config.operations.put, PutClient::with_policy);
        match &self.identity {
            Some(id) => client.with_identity(id.clone()),
            None => client,
        }
    }

    fn query_client(&self) -> QueryClient {
        let client = QueryClient::new(Arc::clone(&self.exchange));
        let client = apply(client, self.config.operations.query, QueryClient::with_policy);
        match &self.identity {
            Some(id) => client.with_identity(id.clone()),
            None => client,
        }
    }

    /// Engines for all tasks, or for the named one.
    fn engines(&self, only: Option<&str>) -> Result<Vec<(Arc<SyncEngine>, Duration)>> {
        let tasks: Vec<_> = match only {
            Some(name) => match self.config.task(name) {
                Some(task) => vec![task],
                None => bail!("No sync task named {:?}", name),
            },
            None => self.config.sync.tasks.iter().collect(),
        };

        let watermarks: Arc<dyn WatermarkStore> =
            Arc::new(FileWatermarkStore::new(&self.config.sync.state_dir));
        let locks = LockManager::new(&self.config.sync.lock_dir);

        Ok(tasks
            .into_iter()
            .map(|task| {
                let sinks = task
                    .sinks
                    .iter()
                    .map(|s| {
                        Sink::new(&s.folder)
                            .with_types(s.types.clone())
                            .with_hook(s.hook.clone())
                    })
                    .collect();
                let engine = SyncEngine::new(
                    &task.name,
                    SyncEngine::watermark_key(&self.config.endpoint.url, &task.name),
                    self.list_client(),
                    self.get_client(),
                    locks.clone(),
                    Arc::clone(&watermarks),
                    sinks,
                );
                (Arc::new(engine), task.interval())
            })
            .collect())
    }

    /// Show what the endpoint said when a call was rejected.
    fn report_rejection(&self) {
        if let Some(text) = self.exchange.last_metadata().reject_text {
            eprintln!("{}\n{}", "Endpoint response:".yellow(), text);
        }
    }
}

fn apply<C>(client: C, policy: OperationPolicy, with_policy: fn(C, bool, bool) -> C) -> C {
    with_policy(client, policy.sign_outbound, policy.verify_inbound)
}

/// A relative config path missing from the working directory falls back
/// to the per-user config directory.
fn resolve_config(path: PathBuf) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path;
    }
    match dirs::config_dir().map(|d| d.join("mexsync").join(&path)) {
        Some(candidate) if candidate.exists() => candidate,
        _ => path,
    }
}

fn write_output(output: Option<&Path>, data: &[u8]) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

async fn cmd_get(app: &App, args: GetArgs) -> Result<()> {
    let selector = match (args.code, args.message_id, args.next) {
        (Some(code), _, _) => GetSelector::Code(code),
        (None, Some(id), _) => GetSelector::MessageIdentification {
            id,
            version: args.version,
        },
        (None, None, _) => GetSelector::NextInQueue,
    };

    let result = app.get_client().get(&selector).await?;
    if let Some(signer) = &result.signer {
        info!(subject = signer.subject(), "Signed by");
    }
    match result.content {
        GetContent::Xml(xml) => write_output(args.output.as_deref(), xml.as_bytes()),
        GetContent::Binary {
            data, file_name, ..
        } => {
            info!(file_name = %file_name, bytes = data.len(), "Binary content");
            write_output(args.output.as_deref(), &data)
        }
    }
}

async fn cmd_list(app: &App, args: ListArgs) -> Result<()> {
    let window = match (args.start, args.end) {
        (Some(start), Some(end)) => ListWindow::Interval {
            start,
            end,
            interval_type: match args.interval_type {
                IntervalArg::Application => IntervalType::Application,
                IntervalArg::Server => IntervalType::Server,
            },
        },
        _ => ListWindow::AfterCode(args.after.unwrap_or(0)),
    };
    let query = ListQuery {
        window,
        message_identification: args.message_id,
        msg_type: args.msg_type,
        owner: args.owner,
    };

    let result = app.list_client().list(&query).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result.entries)?);
    } else {
        for e in &result.entries {
            println!(
                "{:>10}  {:<8} {:<40} {:<4} {:<20} {}",
                e.code.to_string().bold(),
                e.message_type,
                e.message_identification,
                e.version.as_deref().unwrap_or("-"),
                e.owner,
                e.server_timestamp.to_rfc3339()
            );
        }
    }
    for fault in &result.faults {
        eprintln!("{} {}", "warning:".yellow(), fault);
    }
    Ok(())
}

async fn cmd_put(app: &App, args: PutArgs) -> Result<()> {
    let content = if args.binary {
        let data = std::fs::read(&args.file)
            .with_context(|| format!("Failed to read {}", args.file.display()))?;
        let file_name = args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Attachment path has no file name")?;
        PutContent::Binary {
            data,
            file_name,
            format: args.format,
        }
    } else {
        PutContent::Xml(
            std::fs::read_to_string(&args.file)
                .with_context(|| format!("Failed to read {}", args.file.display()))?,
        )
    };

    let result = app.put_client().put(&content).await?;
    println!("{} {}", "Result:".green(), result.result);
    for (id_type, value) in &result.ids {
        println!("  {id_type}: {value}");
    }
    Ok(())
}

async fn cmd_query(app: &App, args: QueryArgs) -> Result<()> {
    let mut query = QueryRequest::new(args.data_type);
    for (name, value) in args.params {
        query = query.parameter(name, value);
    }
    query.start = args.start;
    query.end = args.end;

    let payload = app.query_client().query(&query).await?;
    println!("{payload}");
    Ok(())
}

async fn cmd_sync(app: &App, task: Option<String>) -> Result<()> {
    let mut failed = false;
    for (engine, _) in app.engines(task.as_deref())? {
        match engine.tick().await {
            Ok(stats) => println!(
                "{} {}: {} listed, {} delivered, {} already present, {} locked, {} filtered, {} failed, watermark {}",
                "✓".green(),
                engine.name(),
                stats.listed,
                stats.delivered,
                stats.skipped_existing,
                stats.skipped_locked,
                stats.filtered,
                stats.failed,
                stats.watermark
            ),
            Err(e) => {
                failed = true;
                eprintln!("{} {}: {:#}", "✗".red(), engine.name(), anyhow::Error::new(e));
            }
        }
    }
    if failed {
        bail!("One or more sync tasks failed");
    }
    Ok(())
}

async fn cmd_run(app: &App) -> Result<()> {
    let mut scheduler = Scheduler::new();
    for (engine, period) in app.engines(None)? {
        scheduler.add(engine, period);
    }
    if scheduler.is_empty() {
        bail!("No sync tasks configured");
    }

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down, waiting for running ticks");
    let _ = tx.send(true);
    handle.await.context("Scheduler task panicked")?;
    Ok(())
}

fn cmd_unlock(config: &Config, older_than_secs: u64) -> Result<()> {
    let removed = LockManager::new(&config.sync.lock_dir)
        .clear_stale(Duration::from_secs(older_than_secs))?;
    println!("Removed {removed} stale lock(s)");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = resolve_config(cli.config);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    if let Command::Unlock { older_than_secs } = cli.command {
        return cmd_unlock(&config, older_than_secs);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.sync.pool_size)
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(async move {
        let app = App::new(config)?;
        let result = match cli.command {
            Command::Get(args) => cmd_get(&app, args).await,
            Command::List(args) => cmd_list(&app, args).await,
            Command::Put(args) => cmd_put(&app, args).await,
            Command::Query(args) => cmd_query(&app, args).await,
            Command::Sync { task } => cmd_sync(&app, task).await,
            Command::Run => cmd_run(&app).await,
            Command::Unlock { .. } => Ok(()),
        };
        if result.is_err() {
            app.report_rejection();
        }
        result
    })
}
