// Engine bootstrap
//
// Wires the store, event hub, parser registry, media queue, scanner and
// watcher together. Startup recovery runs before any worker starts, so no
// task is PROCESSING once the queue is up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::constants::DB_POOL_EXTRA_CONNECTIONS;
use crate::db::{get_db_path, DbPool};
use crate::db::schema::TaskKind;
use crate::error::{MediaError, Result};
use crate::events::{Event, EventHub, EventPublisher, HubStats, Subscription, TopicFilter};
use crate::ingest::scan::{ScanOptions, ScanProgress, ScanService};
use crate::ingest::watcher::WatchService;
use crate::ingest::{Ingestor, RegisteredRoot};
use crate::jobs::{MediaQueue, QueueOptions, QueueStats, TaskSink};
use crate::parsers::{default_registry, ParserRegistry};
use crate::store::event_log::EventLog;
use crate::store::{AssetStore, StoreOptions};
use crate::tools::ToolCaps;

/// The persistent half of the engine: database, asset store and event log.
/// Enough for read-only commands that do not run workers.
pub struct Library {
    pub data_dir: PathBuf,
    pub pool: Arc<DbPool>,
    pub store: Arc<AssetStore>,
    pub event_log: Arc<EventLog>,
}

impl Library {
    pub fn open(data_dir: &Path, config: &EngineConfig) -> Result<Self> {
        let pool = Arc::new(DbPool::open(
            &get_db_path(data_dir),
            config.worker_count + DB_POOL_EXTRA_CONNECTIONS,
        )?);
        let store = Arc::new(AssetStore::open(
            Arc::clone(&pool),
            StoreOptions {
                max_parse_attempts: config.max_parse_attempts,
                bloom_false_positive_rate: config.bloom_false_positive_rate,
            },
        )?);
        let event_log = Arc::new(EventLog::new(
            Arc::clone(&pool),
            config.event_log_max_rows,
            config.event_log_max_age_days,
        ));
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            pool,
            store,
            event_log,
        })
    }
}

pub struct Engine {
    library: Library,
    config: EngineConfig,
    hub: Arc<EventHub>,
    registry: Arc<ParserRegistry>,
    ingestor: Arc<Ingestor>,
    queue: Option<MediaQueue>,
    scanner: Option<ScanService>,
    watcher: Option<WatchService>,
}

impl Engine {
    /// Start with the config found in `data_dir` and the tools on this machine
    pub fn open(data_dir: &Path) -> Result<Self> {
        let config = EngineConfig::load(data_dir)?;
        Self::start(data_dir, config)
    }

    pub fn start(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        Self::start_with_tools(data_dir, config, ToolCaps::probe())
    }

    pub fn start_with_tools(data_dir: &Path, config: EngineConfig, caps: ToolCaps) -> Result<Self> {
        config.validate()?;
        log::info!("Starting media engine in {}", data_dir.display());

        let library = Library::open(data_dir, &config)?;

        let (tasks_recovered, assets_recovered) = library.store.recover()?;
        if tasks_recovered > 0 || assets_recovered > 0 {
            log::warn!(
                "Recovered from unclean shutdown: {} tasks and {} assets rewound",
                tasks_recovered,
                assets_recovered
            );
        } else {
            log::info!("Startup recovery: nothing to rewind");
        }

        if let Err(e) = library.event_log.apply_retention() {
            log::warn!("Event log retention failed: {}", e);
        }

        let hub = Arc::new(EventHub::with_sink(config.subscriber_capacity, library.event_log.clone()));
        let publisher: Arc<dyn EventPublisher> = hub.clone();

        let registry = Arc::new(default_registry(Arc::new(caps), &config.external_parsers));

        let queue = MediaQueue::start(
            Arc::clone(&library.store),
            Arc::clone(&registry),
            Arc::clone(&publisher),
            QueueOptions::from_config(&config),
        )?;

        let mut roots = Vec::with_capacity(config.roots.len());
        for root in &config.roots {
            let root = RegisteredRoot::from_config(root)?;
            if !root.path.is_dir() {
                log::warn!("Root {} is not a directory (yet); it will be scanned when it appears", root.path.display());
            }
            roots.push(root);
        }

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&library.store),
            Arc::new(queue.handle()),
            Arc::clone(&publisher),
            roots,
        ));

        let scanner = ScanService::start(
            Arc::clone(&ingestor),
            ScanOptions {
                startup_scan: config.startup_scan,
                rescan_interval: config.rescan_interval_secs.map(Duration::from_secs),
            },
        )?;

        let watcher = if config.watch {
            match WatchService::start(
                Arc::clone(&ingestor),
                Some(scanner.handle()),
                Duration::from_millis(config.debounce_ms),
            ) {
                Ok(w) => Some(w),
                Err(e) => {
                    // Scans still keep the index correct, only slower
                    log::error!("Watcher unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        publisher.publish(Event::EngineStarted {
            tasks_recovered,
            assets_recovered,
        });
        log::info!("Media engine started with {} roots", ingestor.roots().len());

        Ok(Self {
            library,
            config,
            hub,
            registry,
            ingestor,
            queue: Some(queue),
            scanner: Some(scanner),
            watcher,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.library.data_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.library.store
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.library.event_log
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        self.hub.subscribe(filter)
    }

    pub fn hub_stats(&self) -> HubStats {
        self.hub.stats()
    }

    /// Parsers registered here take effect for the next task claimed
    pub fn registry(&self) -> &Arc<ParserRegistry> {
        &self.registry
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Queue a task for an existing asset
    pub fn submit(&self, asset_id: &str, kind: TaskKind) -> Result<()> {
        match &self.queue {
            Some(queue) => queue.handle().submit(asset_id, kind),
            None => Err(MediaError::QueueStopped),
        }
    }

    pub fn request_scan(&self, roots: Vec<RegisteredRoot>) -> Result<()> {
        match &self.scanner {
            Some(scanner) => scanner.request_scan(roots),
            None => Ok(()),
        }
    }

    pub fn scan_progress(&self) -> ScanProgress {
        self.scanner.as_ref().map(|s| s.progress()).unwrap_or_default()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.as_ref().map(|q| q.stats()).unwrap_or_default()
    }

    /// Wait for the running scan to finish and the queue to drain.
    /// Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let until = std::time::Instant::now() + timeout;
        loop {
            let scanning = self
                .scanner
                .as_ref()
                .map(|s| {
                    let p = s.progress();
                    p.running || p.queued > 0
                })
                .unwrap_or(false);
            let queue_idle = match &self.queue {
                Some(q) => q.is_idle()?,
                None => true,
            };
            if !scanning && queue_idle {
                return Ok(true);
            }
            if std::time::Instant::now() >= until {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Stop producers first, then the queue
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        log::info!("Media engine stopping");
        self.hub.publish(Event::EngineStopping);

        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(scanner) = self.scanner.take() {
            scanner.stop();
        }
        queue.shutdown();
        log::info!("Media engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
