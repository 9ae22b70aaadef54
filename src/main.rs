// Media Assistant CLI binary

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};

use media_assistant::config::{resolve_data_dir, EngineConfig, RootConfig};
use media_assistant::db::schema::{Asset, AssetStatus, TaskKind, TaskStatus};
use media_assistant::engine::{Engine, Library};
use media_assistant::ingest::RegisteredRoot;

#[derive(Parser)]
#[command(name = "media-assistant")]
#[command(about = "Media Assistant - index and process media files under watched folders", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory (MEDIA_ASSISTANT_DATA_DIR wins when set)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C
    Run {
        /// Extra root to watch, in the global scope
        #[arg(long)]
        root: Vec<PathBuf>,
    },

    /// Scan a folder once, process everything found, then exit
    Scan {
        /// Folder to scan
        path: PathBuf,
        /// Record assets privately for this project
        #[arg(long)]
        project: Option<String>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// List assets
    List {
        /// Only assets with this status (NEW, INDEXING, INDEXED, FAILED, MISSING)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "100")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },

    /// Show asset details
    Show {
        /// Asset ID
        id: String,
    },

    /// List media tasks
    Tasks {
        /// Only tasks with this status (PENDING, PROCESSING, DONE, FAILED)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show the event log
    Events {
        /// Only events after this id
        #[arg(long, default_value = "0")]
        since: i64,
        /// Only events about this asset
        #[arg(long)]
        asset: Option<String>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Regenerate an asset's thumbnail, or export the stored one
    Thumbs {
        /// Asset ID
        id: String,
        /// Write the stored thumbnail to this file instead
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Find images that look like this one
    Similar {
        /// Asset ID
        id: String,
        /// Maximum dHash Hamming distance
        #[arg(long, default_value = "10")]
        max_distance: u32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir.as_deref()).context("Failed to resolve data directory")?;
    let config = EngineConfig::load(&data_dir).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { root } => cmd_run(&data_dir, config, root),
        Commands::Scan { path, project, timeout } => cmd_scan(&data_dir, config, path, project, timeout),
        Commands::List { status, limit, offset } => cmd_list(&data_dir, &config, status, limit, offset),
        Commands::Show { id } => cmd_show(&data_dir, &config, &id),
        Commands::Tasks { status, limit } => cmd_tasks(&data_dir, &config, status, limit),
        Commands::Events { since, asset, limit } => cmd_events(&data_dir, &config, since, asset, limit),
        Commands::Thumbs { id, out } => cmd_thumbs(&data_dir, config, &id, out),
        Commands::Similar { id, max_distance } => cmd_similar(&data_dir, &config, &id, max_distance),
    }
}

/// Channel that fires once on Ctrl-C
fn interrupt_channel() -> Result<crossbeam_channel::Receiver<()>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(rx)
}

fn cmd_run(data_dir: &Path, mut config: EngineConfig, extra_roots: Vec<PathBuf>) -> Result<()> {
    for root in extra_roots {
        config.roots.push(RootConfig::global(root));
    }
    if config.roots.is_empty() {
        log::warn!("No roots configured; add some to config.json or pass --root");
    }

    let interrupted = interrupt_channel()?;
    let engine = Engine::start(data_dir, config).context("Failed to start engine")?;

    println!("Media engine running. Press Ctrl-C to stop.");
    let _ = interrupted.recv();

    let stats = engine.queue_stats();
    let hub = engine.hub_stats();
    engine.shutdown();

    println!();
    println!("Stopped:");
    println!("  Tasks completed: {}", stats.completed);
    println!("  Tasks retried:   {}", stats.retried);
    println!("  Tasks failed:    {}", stats.failed);
    println!("  Events:          {} published, {} dropped", hub.published, hub.dropped_total);
    Ok(())
}

fn cmd_scan(data_dir: &Path, mut config: EngineConfig, path: PathBuf, project: Option<String>, timeout: u64) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }
    let root_config = match &project {
        Some(id) => RootConfig::private(&path, id),
        None => RootConfig::global(&path),
    };
    let root = RegisteredRoot::from_config(&root_config)?;
    config.roots = vec![root_config];
    config.startup_scan = false;
    config.watch = false;

    let interrupted = interrupt_channel()?;
    let engine = Engine::start(data_dir, config).context("Failed to start engine")?;

    println!("Scanning {}", root.path.display());
    engine.request_scan(vec![root])?;

    let deadline = std::time::Instant::now() + Duration::from_secs(timeout);
    let mut drained = false;
    while std::time::Instant::now() < deadline {
        if engine.wait_idle(Duration::from_millis(500))? {
            drained = true;
            break;
        }
        if interrupted.try_recv().is_ok() {
            println!("Interrupted; unfinished work resumes on the next run");
            break;
        }
    }

    let progress = engine.scan_progress();
    let stats = engine.queue_stats();
    let store = engine.store().clone();
    engine.shutdown();

    println!();
    println!("Scan {}:", if drained { "complete" } else { "incomplete" });
    println!("  Files seen:  {}", progress.seen);
    println!("  Created:     {}", progress.created);
    println!("  Changed:     {}", progress.changed);
    println!("  Missing:     {}", progress.missing);
    println!("  Errors:      {}", progress.errors);
    println!("  Tasks done:  {} ({} failed)", stats.completed, stats.failed);
    println!();
    for (status, count) in store.status_counts()? {
        println!("  {:<10} {}", status, count);
    }
    Ok(())
}

fn parse_asset_status(raw: Option<String>) -> Result<Option<AssetStatus>> {
    raw.map(|s| AssetStatus::parse(&s).ok_or_else(|| anyhow::anyhow!("Unknown asset status '{}'", s)))
        .transpose()
}

fn cmd_list(data_dir: &Path, config: &EngineConfig, status: Option<String>, limit: i64, offset: i64) -> Result<()> {
    let status = parse_asset_status(status)?;
    let library = Library::open(data_dir, config)?;
    let assets = library.store.list(status, limit, offset)?;
    let total = library.store.count()?;

    println!("{} assets total", total);
    println!();

    if assets.is_empty() {
        println!("No assets found. Use 'media-assistant scan <path>' to add some.");
        return Ok(());
    }

    println!("{:<36}  {:<8}  {:<6}  {:>10}  {}", "ID", "Status", "Format", "Size", "Path");
    println!("{}", "-".repeat(100));
    for asset in &assets {
        println!(
            "{:<36}  {:<8}  {:<6}  {:>10}  {}",
            asset.id,
            asset.status,
            asset.format.as_deref().unwrap_or("-"),
            format_size(asset.size),
            asset.path
        );
    }

    if assets.len() as i64 == limit {
        println!();
        println!("Showing {} from offset {}. Use --limit/--offset to see more.", limit, offset);
    }
    Ok(())
}

fn load_asset(library: &Library, id: &str) -> Result<Asset> {
    library
        .store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("Asset {} not found", id))
}

fn cmd_show(data_dir: &Path, config: &EngineConfig, id: &str) -> Result<()> {
    let library = Library::open(data_dir, config)?;
    let asset = load_asset(&library, id)?;

    println!("Asset {}", asset.id);
    println!();
    println!("Path:        {}", asset.path);
    println!("Scope:       {}", asset.scope);
    println!("Status:      {}", asset.status);
    println!("Size:        {}", format_size(asset.size));
    println!("Modified:    {}", format_nanos(asset.mtime));
    if let Some(format) = &asset.format {
        println!("Format:      {}", format);
    }
    if let Some(fp) = &asset.fingerprint {
        println!("Fingerprint: {}", fp);
    }
    if let Some(parent) = &asset.parent_asset_id {
        println!("Duplicate of: {}", parent);
    }
    if asset.attempts > 0 {
        println!("Attempts:    {}", asset.attempts);
    }
    if let Some(err) = &asset.last_error {
        println!("Last error:  {}", err);
    }
    println!("Created:     {}", format_millis(asset.created_at));
    println!("Updated:     {}", format_millis(asset.updated_at));

    if let Some(meta) = asset.media_metadata()? {
        println!();
        println!("Metadata:");
        println!("{}", serde_json::to_string_pretty(&meta)?);
    }
    if let Some(thumb) = library.store.thumbnail(&asset.id)? {
        println!();
        println!("Thumbnail:   {} ({})", format_size(thumb.bytes.len() as i64), thumb.mime);
    }

    let tasks = library.store.tasks_for_asset(&asset.id)?;
    if !tasks.is_empty() {
        println!();
        println!("Tasks:");
        for task in tasks {
            println!(
                "  #{:<6} {:<12} {:<10} attempts={} {}",
                task.id,
                task.kind,
                task.status,
                task.attempts,
                task.last_error.unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn cmd_tasks(data_dir: &Path, config: &EngineConfig, status: Option<String>, limit: i64) -> Result<()> {
    let status = status
        .map(|s| TaskStatus::parse(&s).ok_or_else(|| anyhow::anyhow!("Unknown task status '{}'", s)))
        .transpose()?;
    let library = Library::open(data_dir, config)?;

    println!("{:<12}  {:<10}  {:>8}", "Kind", "Status", "Count");
    println!("{}", "-".repeat(34));
    for (kind, status, count) in library.store.task_counts()? {
        println!("{:<12}  {:<10}  {:>8}", kind, status, count);
    }
    println!();

    let tasks = library.store.list_tasks(status, limit)?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!("{:>7}  {:<36}  {:<12}  {:<10}  {:>3}  {}", "ID", "Asset", "Kind", "Status", "Try", "Enqueued");
    println!("{}", "-".repeat(100));
    for task in tasks {
        println!(
            "{:>7}  {:<36}  {:<12}  {:<10}  {:>3}  {}",
            task.id,
            task.asset_id,
            task.kind,
            task.status,
            task.attempts,
            format_millis(task.enqueued_at)
        );
        if let Some(err) = task.last_error {
            println!("         {}", err);
        }
    }
    Ok(())
}

fn cmd_events(data_dir: &Path, config: &EngineConfig, since: i64, asset: Option<String>, limit: i64) -> Result<()> {
    let library = Library::open(data_dir, config)?;
    let records = match &asset {
        Some(id) => library.event_log.for_subject(id, limit)?,
        None => library.event_log.since(since, limit)?,
    };

    if records.is_empty() {
        println!("No events.");
        return Ok(());
    }
    for record in records {
        println!(
            "{:>7}  {}  {:<22}  {}",
            record.id,
            format_millis(record.created_at),
            record.event_type,
            record.payload
        );
    }
    Ok(())
}

fn cmd_thumbs(data_dir: &Path, mut config: EngineConfig, id: &str, out: Option<PathBuf>) -> Result<()> {
    if let Some(out) = out {
        let library = Library::open(data_dir, &config)?;
        let asset = load_asset(&library, id)?;
        let thumb = library
            .store
            .thumbnail(&asset.id)?
            .ok_or_else(|| anyhow::anyhow!("Asset {} has no thumbnail", id))?;
        std::fs::write(&out, &thumb.bytes).with_context(|| format!("Failed to write {}", out.display()))?;
        println!("Wrote {} to {}", format_size(thumb.bytes.len() as i64), out.display());
        return Ok(());
    }

    config.roots.clear();
    config.startup_scan = false;
    config.watch = false;
    let engine = Engine::start(data_dir, config).context("Failed to start engine")?;

    let asset = engine
        .store()
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("Asset {} not found", id))?;
    if asset.status != AssetStatus::Indexed {
        anyhow::bail!("Asset {} is {}; only INDEXED assets get new thumbnails", id, asset.status);
    }

    engine.submit(&asset.id, TaskKind::Thumbnail)?;
    let drained = engine.wait_idle(Duration::from_secs(120))?;
    let thumb = engine.store().thumbnail(&asset.id)?;
    engine.shutdown();

    match thumb {
        Some(t) if drained => println!("Thumbnail regenerated ({})", format_size(t.bytes.len() as i64)),
        Some(_) => println!("Timed out; the thumbnail task resumes on the next run"),
        None => println!("No thumbnail could be produced for {}", asset.path),
    }
    Ok(())
}

fn cmd_similar(data_dir: &Path, config: &EngineConfig, id: &str, max_distance: u32) -> Result<()> {
    let library = Library::open(data_dir, config)?;
    let asset = load_asset(&library, id)?;
    let similar = library.store.similar_images(&asset.id, max_distance)?;

    println!("Images similar to {}", asset.path);
    println!();
    if similar.is_empty() {
        println!("None within distance {}.", max_distance);
        return Ok(());
    }
    for s in similar {
        println!("  {:>2}  {}  {}", s.distance, s.asset_id, s.path);
    }
    Ok(())
}

fn format_millis(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

fn format_nanos(ns: i64) -> String {
    format_millis(ns.div_euclid(1_000_000))
}

fn format_size(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
