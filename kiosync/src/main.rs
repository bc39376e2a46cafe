//! kiosync - offline-first survey sync for kiosks
//!
//! Operator tool for inspecting and driving the local store: queue
//! responses, deliver them, and manage cached event definitions.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/kiosync/store.db (~/.local/share/kiosync/store.db)
//! - Logs: $XDG_STATE_HOME/kiosync/kiosync.log (~/.local/state/kiosync/kiosync.log)
//! - Config: $XDG_CONFIG_HOME/kiosync/config.toml (~/.config/kiosync/config.toml)

mod process_lock;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use kiosync_core::{
    Brand, Config, Database, DefinitionCache, DefinitionDocument, EndpointKind, ParentMeta,
    RemoteAdapters, SyncEngine, SyncMetrics, SyncQueue, SyncRunOutcome, SyncStatus, TcpProbe,
};

use crate::process_lock::acquire_sync_guard;

#[derive(Parser)]
#[command(name = "kiosync")]
#[command(about = "Offline-first survey sync for kiosks")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store and run migrations
    Init,

    /// Show queue, response and cache status
    Status,

    /// Queue a completed survey response
    Enqueue {
        /// Event the response belongs to
        #[arg(long)]
        parent_id: String,

        /// Event brand: other, brand_a, brand_b, co_branded
        #[arg(long)]
        brand: Brand,

        /// Answers as a JSON object
        #[arg(long)]
        data: String,

        /// Event id known to the brand systems (default: parent id)
        #[arg(long)]
        event_id: Option<String>,
    },

    /// Deliver queued items
    Sync {
        /// Keep running, syncing on reconnect and on the configured interval
        #[arg(short, long)]
        watch: bool,
    },

    /// Drop every queued item without delivering it
    ClearQueue,

    /// List cached event definitions
    Definitions {
        /// Only this category
        #[arg(long)]
        category: Option<Brand>,
    },

    /// Cache a definition document read from a JSON file
    CacheDefinition {
        #[arg(long)]
        id: String,

        #[arg(long)]
        category: Brand,

        #[arg(long)]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        kiosync_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Init => cmd_init(&config),
        Command::Status => cmd_status(&config),
        Command::Enqueue {
            parent_id,
            brand,
            data,
            event_id,
        } => cmd_enqueue(&config, parent_id, brand, &data, event_id),
        Command::Sync { watch } => cmd_sync(config, watch),
        Command::ClearQueue => cmd_clear_queue(&config),
        Command::Definitions { category } => cmd_definitions(&config, category),
        Command::CacheDefinition { id, category, file } => {
            cmd_cache_definition(&config, id, category, &file)
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<Database>> {
    let db_path = config.database_path();
    tracing::info!(path = %db_path.display(), "Opening store");

    let db = Database::open(&db_path, config.store.encryption_key.as_deref())
        .context("failed to open store")?;
    db.initialize().context("failed to run store migrations")?;
    Ok(Arc::new(db))
}

fn cmd_init(config: &Config) -> Result<()> {
    let db = open_store(config)?;
    println!("Store: {}", config.database_path().display());
    println!("Schema version: {}", db.schema_version()?);
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let db = open_store(config)?;
    let cache = DefinitionCache::new(Arc::clone(&db), config.cache.max_age());

    println!("Store: {}", config.database_path().display());
    println!();

    println!("Sync queue");
    println!("==========");
    println!("Pending items:   {}", db.count_queue_items()?);
    for kind in [
        EndpointKind::PrimaryStore,
        EndpointKind::BrandA,
        EndpointKind::BrandB,
    ] {
        let items = db.list_queue_items(Some(kind))?;
        if items.is_empty() {
            continue;
        }
        let retrying = items.iter().filter(|i| i.retry_count > 0).count();
        println!(
            "  {:<14} {} ({} retrying)",
            kind.as_str(),
            items.len(),
            retrying
        );
    }
    println!();

    println!("Responses");
    println!("=========");
    for status in [
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Failed,
    ] {
        println!(
            "  {:<14} {}",
            status.as_str(),
            db.list_responses(Some(status))?.len()
        );
    }
    println!();

    println!("Definition cache");
    println!("================");
    println!("Definitions:     {}", cache.list(None)?.len());
    println!("Stale:           {}", cache.is_stale(cache.max_age())?);

    Ok(())
}

fn cmd_enqueue(
    config: &Config,
    parent_id: String,
    brand: Brand,
    data: &str,
    event_id: Option<String>,
) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(data).context("--data must be valid JSON")?;
    let parent = ParentMeta {
        id: parent_id,
        brand,
        event_id,
    };

    let db = open_store(config)?;
    let response = SyncQueue::new(db)
        .queue_user_response(data, &parent)
        .context("failed to queue response")?;

    println!(
        "Queued response {} for {} ({} item(s))",
        response.id,
        parent.id,
        brand.endpoint_kinds().len()
    );
    Ok(())
}

fn cmd_sync(config: Config, watch: bool) -> Result<()> {
    let db_path = config.database_path();
    let _sync_guard = acquire_sync_guard(&db_path).context("failed to acquire process lock")?;

    let remote =
        RemoteAdapters::from_config(&config).context("failed to configure remote endpoints")?;
    let engine = SyncEngine::open(config, remote).context("failed to open sync engine")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    if watch {
        runtime.block_on(run_watch_mode(&engine))
    } else {
        runtime.block_on(run_single_sync(&engine))
    }
}

/// Probe once, then drain the queue with a progress bar
async fn run_single_sync(engine: &SyncEngine) -> Result<()> {
    let probe = TcpProbe::from_config(&engine.config().connectivity);
    engine.monitor().apply(probe.probe().await);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );
    {
        let pb = pb.clone();
        engine.set_progress_callback(move |progress| {
            pb.set_length(progress.total as u64);
            pb.set_position((progress.completed + progress.failed + progress.deferred) as u64);
            if let Some(label) = &progress.current_item_label {
                pb.set_message(label.clone());
            }
        });
    }

    let outcome = engine.start_sync().await.context("sync failed")?;
    pb.finish_and_clear();

    match outcome {
        SyncRunOutcome::Offline => {
            println!(
                "Offline: {} item(s) left queued",
                engine.get_sync_status()?.pending_count
            );
        }
        SyncRunOutcome::AlreadyRunning => println!("A sync run is already in progress"),
        SyncRunOutcome::Completed(metrics) => print_sync_result(&metrics),
    }

    tracing::info!("kiosync sync complete");
    Ok(())
}

/// Run until Ctrl+C, syncing on reconnect and on the configured interval
async fn run_watch_mode(engine: &SyncEngine) -> Result<()> {
    engine.set_completion_callback(|metrics| {
        if metrics.total == 0 {
            return;
        }
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        println!(
            "[{}] Delivered {}, requeued {}, abandoned {}",
            timestamp, metrics.delivered, metrics.requeued, metrics.abandoned
        );
    });

    let (triggers, probe) = engine.start_background();

    println!(
        "Watch mode active (sync every {}s and on reconnect). Press Ctrl+C to stop.",
        engine.config().sync.interval_secs
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    eprintln!("\nShutting down...");
    probe.abort();
    triggers.shutdown().await;

    println!("Watch mode stopped.");
    tracing::info!("kiosync watch mode stopped");
    Ok(())
}

fn print_sync_result(metrics: &SyncMetrics) {
    println!("Sync complete:");
    println!("  Items:      {}", metrics.total);
    println!("  Delivered:  {}", metrics.delivered);
    println!("  Requeued:   {}", metrics.requeued);
    println!("  Abandoned:  {}", metrics.abandoned);
    if metrics.deferred > 0 {
        println!("  Deferred:   {}", metrics.deferred);
    }
    if metrics.interrupted {
        println!("  Stopped early: connectivity lost");
    }
    println!("  Avg time:   {:?}", metrics.avg_sync_time);
}

fn cmd_clear_queue(config: &Config) -> Result<()> {
    let _sync_guard =
        acquire_sync_guard(&config.database_path()).context("failed to acquire process lock")?;
    let db = open_store(config)?;
    let removed = db.clear_queue()?;
    tracing::warn!(removed, "Cleared sync queue from CLI");
    println!("Removed {} queued item(s)", removed);
    Ok(())
}

fn cmd_definitions(config: &Config, category: Option<Brand>) -> Result<()> {
    let db = open_store(config)?;
    let cache = DefinitionCache::new(db, config.cache.max_age());
    let definitions = cache.list(category)?;

    if definitions.is_empty() {
        println!("No cached definitions");
        return Ok(());
    }

    for def in &definitions {
        let name = def
            .document
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("-");
        println!(
            "{:<24} {:<12} {:<32} cached {}",
            def.id,
            def.category.as_str(),
            name,
            def.cached_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if cache.is_stale(cache.max_age())? {
        println!("\nCache is stale; refresh when online.");
    }
    Ok(())
}

fn cmd_cache_definition(
    config: &Config,
    id: String,
    category: Brand,
    file: &PathBuf,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let db = open_store(config)?;
    let cache = DefinitionCache::new(db, config.cache.max_age());
    cache.cache_definition(&DefinitionDocument {
        id: id.clone(),
        category,
        payload,
    })?;

    println!("Cached definition {} ({})", id, category);
    Ok(())
}
