// Media queue
//
// A fixed-width worker pool driven by one dispatcher thread. The dispatcher
// moves producer submissions into the task table, claims runnable tasks while
// a worker slot is free, sweeps NEW assets that lost their task, and otherwise
// sleeps until a submission, a completion or the poll interval.

pub mod cancel;
pub mod worker;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::constants::{
    DEFAULT_PARSE_DEADLINE_SECS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETRY_BACKOFF_MS,
    DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_SUBMIT_CAPACITY, DEFAULT_WORKER_COUNT,
    ORPHAN_SWEEP_LIMIT, STORE_ERROR_BACKOFF_MS,
};
use crate::db::schema::{MediaTask, TaskKind, TaskStatus};
use crate::error::{MediaError, Result};
use crate::events::EventPublisher;
use crate::parsers::ParserRegistry;
use crate::store::AssetStore;

use cancel::CancelToken;
use worker::{TaskResult, WorkerContext};

/// Where producers (scanner, watcher) send work.
pub trait TaskSink: Send + Sync {
    /// Blocks while the sink is full. Fails once the sink is shut down.
    fn submit(&self, asset_id: &str, kind: TaskKind) -> Result<()>;
}

/// Writes straight to the task table; used when no queue is running.
impl TaskSink for AssetStore {
    fn submit(&self, asset_id: &str, kind: TaskKind) -> Result<()> {
        self.enqueue_task(asset_id, kind)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub worker_count: usize,
    pub parse_deadline: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub submit_capacity: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            parse_deadline: Duration::from_secs(DEFAULT_PARSE_DEADLINE_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            submit_capacity: DEFAULT_SUBMIT_CAPACITY,
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            parse_deadline: Duration::from_secs(config.parse_deadline_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            submit_capacity: config.submit_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub in_flight: usize,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub swept: u64,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    swept: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<TaskResult>) {
        let counter = match result {
            Ok(TaskResult::Done) => &self.completed,
            Ok(TaskResult::Retried) => &self.retried,
            Ok(TaskResult::Failed) | Err(_) => &self.failed,
            Ok(TaskResult::Abandoned) => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Submission {
    asset_id: String,
    kind: TaskKind,
}

/// Cloneable producer side of the queue
#[derive(Clone)]
pub struct QueueHandle {
    submit_tx: Sender<Submission>,
    stop_rx: Receiver<()>,
}

impl QueueHandle {
    fn is_stopped(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl TaskSink for QueueHandle {
    fn submit(&self, asset_id: &str, kind: TaskKind) -> Result<()> {
        if self.is_stopped() {
            return Err(MediaError::QueueStopped);
        }
        let msg = Submission {
            asset_id: asset_id.to_string(),
            kind,
        };
        select! {
            send(self.submit_tx, msg) -> res => res.map_err(|_| MediaError::QueueStopped),
            recv(self.stop_rx) -> _ => Err(MediaError::QueueStopped),
        }
    }
}

pub struct MediaQueue {
    handle: QueueHandle,
    root: CancelToken,
    store: Arc<AssetStore>,
    // Dropping the sender is the stop signal
    stop_tx: Option<Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    exited_rx: Receiver<usize>,
    counters: Arc<Counters>,
    options: QueueOptions,
    worker_id: String,
}

impl MediaQueue {
    pub fn start(
        store: Arc<AssetStore>,
        registry: Arc<ParserRegistry>,
        publisher: Arc<dyn EventPublisher>,
        options: QueueOptions,
    ) -> Result<Self> {
        let root = CancelToken::new();
        let (submit_tx, submit_rx) = bounded::<Submission>(options.submit_capacity);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (work_tx, work_rx) = bounded::<MediaTask>(options.worker_count);
        let (done_tx, done_rx) = unbounded::<()>();
        let (exited_tx, exited_rx) = unbounded::<usize>();
        let counters = Arc::new(Counters::default());
        let worker_id = worker_id();

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            registry,
            publisher,
            parse_deadline: options.parse_deadline,
            retry_backoff: options.retry_backoff,
        });

        let mut workers = Vec::with_capacity(options.worker_count);
        for n in 0..options.worker_count {
            let ctx = Arc::clone(&ctx);
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let exited_tx = exited_tx.clone();
            let root = root.clone();
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("media-worker-{}", n))
                .spawn(move || {
                    for task in work_rx.iter() {
                        let result = ctx.run(&task, &root);
                        if let Err(e) = &result {
                            // Store failure mid-task; the task stays PROCESSING
                            // until the next startup rewinds it
                            log::error!("Task {} aborted: {}", task.id, e);
                        }
                        counters.record(&result);
                        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                        let _ = done_tx.send(());
                    }
                    let _ = exited_tx.send(n);
                })?;
            workers.push(handle);
        }

        let dispatcher = {
            let store = Arc::clone(&store);
            let root = root.clone();
            let stop_rx = stop_rx.clone();
            let counters = Arc::clone(&counters);
            let options = options.clone();
            thread::Builder::new()
                .name("media-dispatcher".into())
                .spawn(move || {
                    let loop_state = Dispatcher {
                        store,
                        root,
                        submit_rx,
                        stop_rx,
                        work_tx,
                        done_rx,
                        counters,
                        options,
                    };
                    loop_state.run();
                })?
        };

        log::info!(
            "Media queue started on {}: {} workers, {}s parse deadline",
            worker_id,
            options.worker_count,
            options.parse_deadline.as_secs()
        );

        Ok(Self {
            handle: QueueHandle { submit_tx, stop_rx },
            root,
            store,
            stop_tx: Some(stop_tx),
            dispatcher: Some(dispatcher),
            workers,
            exited_rx,
            counters,
            options,
            worker_id,
        })
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// True once nothing is queued, in flight or waiting for a task.
    pub fn is_idle(&self) -> Result<bool> {
        if self.counters.in_flight.load(Ordering::SeqCst) > 0 || !self.handle.submit_tx.is_empty() {
            return Ok(false);
        }
        let pending = self.store.count_tasks_with_status(TaskStatus::Pending)?;
        let processing = self.store.count_tasks_with_status(TaskStatus::Processing)?;
        if pending + processing > 0 {
            return Ok(false);
        }
        Ok(self.store.list_pending(1)?.is_empty())
    }

    /// Poll until idle or `timeout`. Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let until = Instant::now() + timeout;
        loop {
            if self.is_idle()? {
                return Ok(true);
            }
            if Instant::now() >= until {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Stop accepting work, cancel in-flight parsers and wait up to the grace
    /// period. Workers still busy after that are abandoned; their tasks stay
    /// PROCESSING for startup recovery.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        log::info!("Media queue stopping ({} in flight)", self.counters.in_flight.load(Ordering::SeqCst));
        self.root.cancel();
        drop(stop_tx);

        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                log::error!("Media dispatcher panicked");
            }
        }

        // The dispatcher dropped the work sender; workers exit after their task
        let deadline = Instant::now() + self.options.shutdown_grace;
        let mut exited = 0;
        while exited < self.workers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exited_rx.recv_timeout(remaining) {
                Ok(_) => exited += 1,
                Err(_) => break,
            }
        }

        let workers = std::mem::take(&mut self.workers);
        if exited == workers.len() {
            for w in workers {
                let _ = w.join();
            }
            log::info!("Media queue stopped");
        } else {
            log::warn!(
                "Media queue abandoned {} busy workers after {}s grace",
                workers.len() - exited,
                self.options.shutdown_grace.as_secs()
            );
        }
    }
}

impl Drop for MediaQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Dispatcher {
    store: Arc<AssetStore>,
    root: CancelToken,
    submit_rx: Receiver<Submission>,
    stop_rx: Receiver<()>,
    work_tx: Sender<MediaTask>,
    done_rx: Receiver<()>,
    counters: Arc<Counters>,
    options: QueueOptions,
}

impl Dispatcher {
    fn run(self) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_loop()));
        if result.is_err() {
            log::error!("Media dispatcher loop panicked");
        }
    }

    fn run_loop(&self) {
        loop {
            if self.root.is_cancelled() {
                break;
            }

            let step = self
                .drain_submissions()
                .and_then(|_| self.fill_workers())
                .and_then(|claimed| if claimed > 0 { Ok(claimed) } else { self.sweep_orphans() });

            match step {
                Ok(progress) if progress > 0 => continue,
                Ok(_) => {}
                Err(e) => {
                    log::error!("Media queue store error, backing off: {}", e);
                    if !self.root.sleep(Duration::from_millis(STORE_ERROR_BACKOFF_MS)) {
                        break;
                    }
                    continue;
                }
            }

            // Nothing claimable: wait for new work, a free slot or the poll tick
            select! {
                recv(self.submit_rx) -> msg => {
                    if let Ok(sub) = msg {
                        if let Err(e) = self.store.enqueue_task(&sub.asset_id, sub.kind) {
                            log::error!("Failed to enqueue {} {}: {}", sub.kind, sub.asset_id, e);
                        }
                    }
                }
                recv(self.done_rx) -> _ => {}
                recv(self.stop_rx) -> _ => break,
                default(self.options.poll_interval) => {}
            }
        }
        log::debug!("Media dispatcher exiting");
    }

    fn drain_submissions(&self) -> Result<usize> {
        let mut n = 0;
        while let Ok(sub) = self.submit_rx.try_recv() {
            self.store.enqueue_task(&sub.asset_id, sub.kind)?;
            n += 1;
        }
        Ok(n)
    }

    /// Claim tasks while a worker is free. Returns how many were dispatched.
    fn fill_workers(&self) -> Result<usize> {
        while self.done_rx.try_recv().is_ok() {}

        let mut claimed = 0;
        while self.counters.in_flight.load(Ordering::SeqCst) < self.options.worker_count {
            if self.root.is_cancelled() {
                break;
            }
            let Some(task) = self.store.claim_next_task()? else {
                break;
            };
            self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
            self.counters.claimed.fetch_add(1, Ordering::Relaxed);
            if self.work_tx.send(task).is_err() {
                // Workers are gone; only happens during shutdown
                self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            claimed += 1;
        }
        Ok(claimed)
    }

    /// Re-queue NEW assets without an active PARSE task
    fn sweep_orphans(&self) -> Result<usize> {
        if self.counters.in_flight.load(Ordering::SeqCst) >= self.options.worker_count {
            return Ok(0);
        }
        let orphans = self.store.list_pending_unqueued(ORPHAN_SWEEP_LIMIT)?;
        let mut queued = 0;
        for asset in orphans {
            if self.store.enqueue_task(&asset.id, TaskKind::Parse)?.is_some() {
                queued += 1;
            }
        }
        if queued > 0 {
            log::debug!("Orphan sweep queued {} assets", queued);
            self.counters.swept.fetch_add(queued as u64, Ordering::Relaxed);
        }
        Ok(queued)
    }
}

fn worker_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", hostname, std::process::id())
}
