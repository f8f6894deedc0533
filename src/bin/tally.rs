//! tally CLI: run the pipeline and inspect its queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tally::config::{Config, Settings};
use tally::db::Db;
use tally::engine::WorkerPool;
use tally::http::{AppState, router};
use tally::ingest::IngestService;
use tally::model::{ItemId, RawEvent, State, WorkItem};
use tally::queue::DurableQueue;
use tally::reporting::ReportingService;
use tally::store::EventStore;
use tally::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "tally", about = "Durable analytics event pipeline")]
struct Cli {
    /// Pipeline settings file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the worker pool
    Serve,
    /// Run the worker pool without the HTTP API
    Work,
    /// Validate one event and enqueue it
    Send {
        #[arg(long)]
        site_id: String,
        #[arg(long, default_value = "pageview")]
        event_type: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        user_id: Option<String>,
        /// ISO-8601 timestamp. Defaults to now.
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Durable queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Count work items per state
    Stats,
    /// List failed work items
    Failed {
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a work item
    Show { id: ItemId },
    /// Move a failed work item back to pending
    Retry { id: ItemId },
    /// Delete done work items
    Purge {
        /// Only items completed at least this many seconds ago
        #[arg(long, default_value_t = 0)]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load_or_default(cli.settings.as_deref())?;

    match cli.command {
        Command::Serve => cmd_serve(&settings).await,
        Command::Work => cmd_work(&settings).await,
        Command::Send {
            site_id,
            event_type,
            path,
            user_id,
            timestamp,
        } => {
            let queue = open_queue(&settings)?;
            let raw = RawEvent {
                site_id: Some(site_id),
                event_type: Some(event_type),
                path: Some(path),
                user_id,
                timestamp: Some(timestamp.unwrap_or_else(|| Utc::now().to_rfc3339())),
            };
            let id = IngestService::new(queue).ingest(raw).await?;
            println!("Enqueued: {id}");
            Ok(())
        }
        Command::Queue { action } => {
            let queue = open_queue(&settings)?;
            match action {
                QueueAction::Stats => cmd_queue_stats(&queue),
                QueueAction::Failed { limit } => cmd_queue_failed(&queue, limit),
                QueueAction::Show { id } => cmd_queue_show(&queue, id),
                QueueAction::Retry { id } => {
                    let item = queue.retry_failed(id)?;
                    println!("Requeued: {} (state: {})", item.id, item.state);
                    Ok(())
                }
                QueueAction::Purge { older_than_secs } => {
                    let cutoff = purge_cutoff(older_than_secs)?;
                    let removed = queue.purge_done(cutoff)?;
                    println!("Purged {removed} done item(s)");
                    Ok(())
                }
            }
        }
    }
}

/// Instant `older_than_secs` before now, or an error when out of range.
fn purge_cutoff(older_than_secs: u64) -> anyhow::Result<DateTime<Utc>> {
    i64::try_from(older_than_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| anyhow::anyhow!("--older-than-secs {older_than_secs} is out of range"))
}

fn open_queue(settings: &Settings) -> anyhow::Result<DurableQueue> {
    let path: &Path = &settings.queue.path;
    DurableQueue::open(path, settings.queue_config())
        .with_context(|| format!("opening queue at {}", path.display()))
}

/// Telemetry, config, queue and event store shared by `serve` and `work`.
struct Runtime {
    config: Config,
    queue: DurableQueue,
    db: Db,
    _guard: TelemetryGuard,
}

async fn start(settings: &Settings) -> anyhow::Result<Runtime> {
    let config = Config::from_env()?;

    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "tally".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let queue = open_queue(settings)?;
    let db = Db::connect(
        config.database_url.expose_secret(),
        settings.workers.max_db_connections,
    )
    .await?;
    db.migrate().await?;

    Ok(Runtime {
        config,
        queue,
        db,
        _guard: guard,
    })
}

async fn cmd_serve(settings: &Settings) -> anyhow::Result<()> {
    let rt = start(settings).await?;
    let store: Arc<dyn EventStore> = Arc::new(rt.db.clone());

    let pool = WorkerPool::new(rt.queue.clone(), Arc::clone(&store), settings.worker_config());
    let workers = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await })
    };

    let state = AppState {
        ingest: IngestService::new(rt.queue.clone()),
        reporting: ReportingService::new(store),
        queue: rt.queue.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&rt.config.bind_addr)
        .await
        .with_context(|| format!("binding {}", rt.config.bind_addr))?;
    info!(addr = %rt.config.bind_addr, "listening");

    let signal_pool = pool.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
            signal_pool.shutdown();
        })
        .await?;

    pool.shutdown();
    workers.await??;
    rt.db.close().await;
    Ok(())
}

async fn cmd_work(settings: &Settings) -> anyhow::Result<()> {
    let rt = start(settings).await?;
    let pool = WorkerPool::new(rt.queue.clone(), Arc::new(rt.db.clone()), settings.worker_config());

    let ctrl = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        ctrl.shutdown();
    });

    pool.run().await?;
    rt.db.close().await;
    Ok(())
}

fn cmd_queue_stats(queue: &DurableQueue) -> anyhow::Result<()> {
    let counts = queue.counts()?;
    println!("Pending:  {}", counts.pending);
    println!("Leased:   {}", counts.leased);
    println!("Done:     {}", counts.done);
    println!("Failed:   {}", counts.failed);
    Ok(())
}

fn cmd_queue_failed(queue: &DurableQueue, limit: usize) -> anyhow::Result<()> {
    let items = queue.list(State::Failed, limit)?;

    if items.is_empty() {
        println!("No failed work items.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<24}  {:<4}  {:<40}  UPDATED",
        "ID", "SITE", "PATH", "TRY", "LAST_ERROR"
    );
    println!("{}", "-".repeat(110));

    for item in &items {
        println!(
            "{:<8}  {:<16}  {:<24}  {:<4}  {:<40}  {}",
            item.id,
            truncate(&item.payload.site_id, 16),
            truncate(&item.payload.path, 24),
            item.attempt_count,
            truncate(item.last_error.as_deref().unwrap_or("-"), 40),
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

fn cmd_queue_show(queue: &DurableQueue, id: ItemId) -> anyhow::Result<()> {
    let item: WorkItem = queue.get(id)?;

    println!("ID:          {}", item.id);
    println!("State:       {}", item.state);
    println!("Attempts:    {}", item.attempt_count);
    println!("Site:        {}", item.payload.site_id);
    println!("Type:        {}", item.payload.event_type);
    println!("Path:        {}", item.payload.path);
    println!(
        "User:        {}",
        item.payload.user_id.as_deref().unwrap_or("-")
    );
    println!("Timestamp:   {}", item.payload.timestamp.to_rfc3339());
    println!("Available:   {}", item.available_at);
    if let Some(ref owner) = item.lease_owner {
        println!("Lease Owner: {owner}");
    }
    if let Some(expires) = item.lease_expires_at {
        println!("Lease Until: {expires}");
    }
    if let Some(ref err) = item.last_error {
        println!("Last Error:  {err}");
    }
    println!("Created:     {}", item.created_at);
    println!("Updated:     {}", item.updated_at);
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
