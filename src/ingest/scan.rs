// Scan service
//
// Full-tree walks that reconcile the store against the filesystem. Each root
// is walked on its own thread. The set of known paths is snapshotted before
// the walk; only snapshot entries that were not seen are candidates for
// MISSING, and only when the walk ran to completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use walkdir::WalkDir;

use crate::constants::{SCAN_PROGRESS_LOG_EVERY, SCAN_REQUEST_CAPACITY};
use crate::error::{MediaError, Result};
use crate::events::Event;
use crate::jobs::cancel::CancelToken;
use crate::store::{path_key, UpsertKind};

use super::{filters, FileStamp, Ingestor, RegisteredRoot};

/// Outcome of one root walk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub root: String,
    pub seen: u64,
    pub created: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub missing: u64,
    pub errors: u64,
    /// False when cancelled; no reconciliation happened
    pub completed: bool,
    pub elapsed_ms: u64,
}

/// Live counters across the running scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub running: bool,
    /// Requests waiting for the scan thread
    pub queued: u64,
    pub scans_completed: u64,
    pub seen: u64,
    pub created: u64,
    pub changed: u64,
    pub missing: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    running: AtomicBool,
    queued: AtomicU64,
    scans_completed: AtomicU64,
    seen: AtomicU64,
    created: AtomicU64,
    changed: AtomicU64,
    missing: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for c in [&self.seen, &self.created, &self.changed, &self.missing, &self.errors] {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            seen: self.seen.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            changed: self.changed.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Walk one root, record every file, then reconcile.
pub fn scan_root(ingestor: &Ingestor, root: &RegisteredRoot, cancel: &CancelToken) -> Result<ScanReport> {
    scan_root_counted(ingestor, root, cancel, &Counters::default())
}

fn scan_root_counted(
    ingestor: &Ingestor,
    root: &RegisteredRoot,
    cancel: &CancelToken,
    counters: &Counters,
) -> Result<ScanReport> {
    let started = Instant::now();
    let root_key = path_key(&root.path);
    let mut report = ScanReport {
        root: root_key.clone(),
        ..Default::default()
    };

    log::info!("Scan started: {} ({})", root_key, root.scope);
    ingestor.publisher().publish(Event::ScanStarted { root: root_key.clone() });

    let mut snapshot: HashMap<String, String> = ingestor.store().known_paths_under(&root.path, &root.scope)?;
    // Directories we could not read; their known files are not swept
    let mut unreadable: Vec<PathBuf> = Vec::new();
    let mut cancelled = false;

    let walker = WalkDir::new(&root.path)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !filters::is_ignored_entry(e));

    for entry in walker {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Scan of {}: {}", root_key, e);
                report.errors += 1;
                counters.errors.fetch_add(1, Ordering::Relaxed);
                if let Some(p) = e.path() {
                    unreadable.push(p.to_path_buf());
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let key = path_key(path);
        report.seen += 1;
        counters.seen.fetch_add(1, Ordering::Relaxed);
        if report.seen % SCAN_PROGRESS_LOG_EVERY == 0 {
            log::info!("Scan of {}: {} files so far", root_key, report.seen);
        }

        let stamp = match entry.metadata() {
            Ok(meta) => FileStamp::from_metadata(&meta),
            Err(e) => {
                // Vanished mid-walk; leave it in the snapshot
                log::debug!("Could not stat {}: {}", key, e);
                report.errors += 1;
                counters.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        snapshot.remove(&key);

        match ingestor.observe_file(path, stamp, &root.scope) {
            Ok((_, UpsertKind::Created)) => {
                report.created += 1;
                counters.created.fetch_add(1, Ordering::Relaxed);
            }
            Ok((_, UpsertKind::Changed)) => {
                report.changed += 1;
                counters.changed.fetch_add(1, Ordering::Relaxed);
            }
            Ok((_, UpsertKind::Unchanged)) => report.unchanged += 1,
            Err(MediaError::QueueStopped) => {
                cancelled = true;
                break;
            }
            Err(e) => {
                log::warn!("Failed to record {}: {}", key, e);
                report.errors += 1;
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    if !cancelled {
        for (path, id) in snapshot {
            let p = Path::new(&path);
            if unreadable.iter().any(|dir| p.starts_with(dir)) || p.is_file() {
                continue;
            }
            if ingestor.store().mark_missing_by_id(&id)? {
                ingestor.publish_missing(&id, &path);
                report.missing += 1;
                counters.missing.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    report.completed = !cancelled;
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    log::info!(
        "Scan {}: {} seen, {} created, {} changed, {} missing, {} errors in {}ms",
        if report.completed { "finished" } else { "stopped" },
        report.seen,
        report.created,
        report.changed,
        report.missing,
        report.errors,
        report.elapsed_ms
    );
    ingestor.publisher().publish(Event::ScanFinished {
        root: root_key,
        seen: report.seen,
        created: report.created,
        changed: report.changed,
        missing: report.missing,
        errors: report.errors,
        completed: report.completed,
    });

    Ok(report)
}

/// Scan several roots, one thread per root
fn scan_roots(
    ingestor: &Ingestor,
    roots: &[RegisteredRoot],
    cancel: &CancelToken,
    counters: &Counters,
) -> Vec<Result<ScanReport>> {
    thread::scope(|s| {
        let handles: Vec<_> = roots
            .iter()
            .map(|root| s.spawn(move || scan_root_counted(ingestor, root, cancel, counters)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(MediaError::Other("scan thread panicked".to_string())))
            })
            .collect()
    })
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub startup_scan: bool,
    pub rescan_interval: Option<Duration>,
}

/// Queues scans onto the scan thread. Cloned into the watcher for overflow
/// rescans.
#[derive(Clone)]
pub struct ScanHandle {
    tx: Sender<Vec<RegisteredRoot>>,
    counters: Arc<Counters>,
}

impl ScanHandle {
    /// Queue a scan of `roots`; an empty list means every registered root.
    pub fn request_scan(&self, roots: Vec<RegisteredRoot>) -> Result<()> {
        // Counted before the send so the scan thread never sees it negative
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.try_send(roots) {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(match e {
                TrySendError::Full(_) => MediaError::Other("Scan request queue is full".to_string()),
                TrySendError::Disconnected(_) => MediaError::Other("Scan service stopped".to_string()),
            });
        }
        Ok(())
    }
}

pub struct ScanService {
    handle: ScanHandle,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl ScanService {
    pub fn start(ingestor: Arc<Ingestor>, options: ScanOptions) -> Result<Self> {
        let (tx, rx) = bounded::<Vec<RegisteredRoot>>(SCAN_REQUEST_CAPACITY);
        let counters = Arc::new(Counters::default());
        let cancel = CancelToken::new();
        let handle = ScanHandle {
            tx,
            counters: Arc::clone(&counters),
        };

        if options.startup_scan {
            // First in line on the scan thread
            handle.request_scan(Vec::new())?;
        }

        let thread = {
            let counters = Arc::clone(&counters);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("media-scanner".into())
                .spawn(move || scan_loop(&ingestor, &rx, &counters, &cancel, options.rescan_interval))?
        };

        Ok(Self {
            handle,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ScanHandle {
        self.handle.clone()
    }

    pub fn request_scan(&self, roots: Vec<RegisteredRoot>) -> Result<()> {
        self.handle.request_scan(roots)
    }

    pub fn progress(&self) -> ScanProgress {
        self.handle.counters.snapshot()
    }

    /// Cancel the running walk and wait for the scan thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::error!("Scan thread panicked");
            }
        }
    }
}

impl Drop for ScanService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan_loop(
    ingestor: &Ingestor,
    rx: &Receiver<Vec<RegisteredRoot>>,
    counters: &Counters,
    cancel: &CancelToken,
    rescan_interval: Option<Duration>,
) {
    // Wake regularly to notice cancellation
    let tick = Duration::from_millis(200);
    let mut next_rescan = rescan_interval.map(|i| Instant::now() + i);

    while !cancel.is_cancelled() {
        let request = match rx.recv_timeout(tick) {
            Ok(roots) => {
                counters.running.store(true, Ordering::SeqCst);
                counters.queued.fetch_sub(1, Ordering::SeqCst);
                Some(roots)
            }
            Err(RecvTimeoutError::Timeout) => match next_rescan {
                Some(at) if Instant::now() >= at => {
                    log::info!("Periodic rescan");
                    Some(Vec::new())
                }
                _ => None,
            },
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(mut roots) = request else {
            continue;
        };

        // Collapse queued requests into one pass
        while let Ok(more) = rx.try_recv() {
            counters.queued.fetch_sub(1, Ordering::SeqCst);
            if more.is_empty() || roots.is_empty() {
                roots.clear();
            } else {
                for r in more {
                    if !roots.contains(&r) {
                        roots.push(r);
                    }
                }
            }
        }
        let roots = if roots.is_empty() { ingestor.roots().to_vec() } else { roots };

        counters.reset();
        counters.running.store(true, Ordering::SeqCst);
        for result in scan_roots(ingestor, &roots, cancel, counters) {
            if let Err(e) = result {
                log::error!("Scan failed: {}", e);
            }
        }
        counters.running.store(false, Ordering::SeqCst);
        counters.scans_completed.fetch_add(1, Ordering::Relaxed);

        next_rescan = rescan_interval.map(|i| Instant::now() + i);
    }
    log::debug!("Scan thread exiting");
}
