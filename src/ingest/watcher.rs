// Filesystem watcher
//
// notify delivers raw events on its own thread; they are pushed into a
// bounded channel and coalesced per path by a debounce thread. When the raw
// channel overflows, or the backend reports it lost events, every root is
// rescanned instead.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::constants::WATCH_RAW_CAPACITY;
use crate::error::{MediaError, Result};
use crate::events::Event;
use crate::jobs::cancel::CancelToken;
use crate::store::path_key;

use super::scan::ScanHandle;
use super::Ingestor;

/// A burst of events on one path is flushed at the latest after this many
/// debounce windows
const MAX_WAIT_FACTOR: u32 = 10;

enum RawEvent {
    Paths(Vec<PathBuf>),
    Rescan,
    Error(String),
}

/// Per-path quiet-period tracking
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, (Instant, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.pending
            .entry(path)
            .and_modify(|(_, last)| *last = now)
            .or_insert((now, now));
    }

    /// Paths quiet for a full window, or held too long
    pub fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let max_wait = window * MAX_WAIT_FACTOR;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (first, last))| now.duration_since(*last) >= window || now.duration_since(*first) >= max_wait)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct WatchService {
    watcher: Option<RecommendedWatcher>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl WatchService {
    /// Watch every registered root recursively. A root that cannot be watched
    /// is logged and skipped; the periodic rescan still covers it.
    pub fn start(ingestor: Arc<Ingestor>, scans: Option<ScanHandle>, debounce: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = bounded::<RawEvent>(WATCH_RAW_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let overflowed = Arc::clone(&overflowed);
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let raw = match res {
                    Ok(event) if event.need_rescan() => RawEvent::Rescan,
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Access(_)) || event.paths.is_empty() {
                            return;
                        }
                        RawEvent::Paths(event.paths)
                    }
                    Err(e) => RawEvent::Error(e.to_string()),
                };
                if let Err(TrySendError::Full(_)) = raw_tx.try_send(raw) {
                    overflowed.store(true, Ordering::SeqCst);
                }
            })?
        };

        for root in ingestor.roots() {
            match watcher.watch(&root.path, RecursiveMode::Recursive) {
                Ok(()) => log::info!("Watching {}", root.path.display()),
                Err(e) => log::warn!("Cannot watch {}: {}", root.path.display(), e),
            }
        }

        let cancel = CancelToken::new();
        let thread = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("media-watcher".into())
                .spawn(move || debounce_loop(&ingestor, scans.as_ref(), &raw_rx, &overflowed, debounce, &cancel))?
        };

        Ok(Self {
            watcher: Some(watcher),
            cancel,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        // Dropping the watcher closes the raw channel
        self.watcher.take();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::error!("Watcher thread panicked");
            }
        }
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn debounce_loop(
    ingestor: &Ingestor,
    scans: Option<&ScanHandle>,
    raw_rx: &Receiver<RawEvent>,
    overflowed: &AtomicBool,
    debounce: Duration,
    cancel: &CancelToken,
) {
    let mut debouncer = Debouncer::new(debounce);
    let tick = (debounce / 2).max(Duration::from_millis(10));

    while !cancel.is_cancelled() {
        match raw_rx.recv_timeout(tick) {
            Ok(RawEvent::Paths(paths)) => {
                let now = Instant::now();
                for path in paths {
                    if !ingestor.roots_for(&path).is_empty() {
                        debouncer.push(path, now);
                    }
                }
            }
            Ok(RawEvent::Rescan) => overflowed.store(true, Ordering::SeqCst),
            Ok(RawEvent::Error(message)) => {
                log::warn!("Watch error: {}", message);
                ingestor.publisher().publish(Event::WatchError { message });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if overflowed.swap(false, Ordering::SeqCst) {
            handle_overflow(ingestor, scans);
        }

        for path in debouncer.due(Instant::now()) {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = flush_path(ingestor, &path) {
                match e {
                    MediaError::QueueStopped => log::debug!("Queue stopped, dropping {}", path.display()),
                    e => log::warn!("Failed to process change to {}: {}", path.display(), e),
                }
            }
        }
    }
    log::debug!("Watcher thread exiting ({} pending changes dropped)", debouncer.len());
}

fn handle_overflow(ingestor: &Ingestor, scans: Option<&ScanHandle>) {
    let roots: Vec<String> = ingestor.roots().iter().map(|r| path_key(&r.path)).collect();
    log::warn!("Watch events lost; rescanning {} roots", roots.len());
    ingestor.publisher().publish(Event::WatchOverflow { roots });
    match scans {
        Some(scans) => {
            if let Err(e) = scans.request_scan(Vec::new()) {
                log::warn!("Could not request rescan: {}", e);
            }
        }
        None => log::warn!("No scan service; lost watch events are not recovered"),
    }
}

/// Apply the current state of `path`: a new directory is walked, a file is
/// observed and a vanished path marks its assets missing.
fn flush_path(ingestor: &Ingestor, path: &Path) -> Result<usize> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => ingestor.observe_dir(path),
        Ok(meta) if meta.is_file() => ingestor.observe_path(path),
        Ok(_) => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => ingestor.observe_removed(path),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debouncer_waits_for_quiet_period() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        d.push(PathBuf::from("/a"), t0);
        d.push(PathBuf::from("/a"), t0 + Duration::from_millis(60));
        assert!(d.due(t0 + Duration::from_millis(120)).is_empty());
        assert_eq!(d.due(t0 + Duration::from_millis(160)), vec![PathBuf::from("/a")]);
        assert!(d.is_empty());
    }

    #[test]
    fn test_debouncer_coalesces_paths() {
        let mut d = Debouncer::new(Duration::from_millis(50));
        let t0 = Instant::now();
        for i in 0..5 {
            d.push(PathBuf::from("/a"), t0 + Duration::from_millis(i));
        }
        d.push(PathBuf::from("/b"), t0);
        assert_eq!(d.len(), 2);
        let mut due = d.due(t0 + Duration::from_millis(100));
        due.sort();
        assert_eq!(due, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn test_debouncer_max_wait() {
        let mut d = Debouncer::new(Duration::from_millis(10));
        let t0 = Instant::now();
        // A file written continuously still gets flushed
        for i in 0..100u64 {
            d.push(PathBuf::from("/busy"), t0 + Duration::from_millis(i * 5));
        }
        assert_eq!(d.due(t0 + Duration::from_millis(496)), vec![PathBuf::from("/busy")]);
    }
}
