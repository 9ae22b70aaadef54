// Ingest tests: scanner reconciliation, ignore rules, scopes and the watcher

use super::scan::{scan_root, ScanOptions, ScanService};
use super::watcher::WatchService;
use super::*;
use crate::db::get_db_path;
use crate::db::DbPool;
use crate::events::{EventHub, TopicFilter};
use crate::jobs::cancel::CancelToken;
use crate::store::StoreOptions;
use filetime::{set_file_mtime, FileTime};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Remembers every submission instead of queueing it
#[derive(Default)]
struct RecordingSink {
    submitted: Mutex<Vec<(String, TaskKind)>>,
}

impl TaskSink for RecordingSink {
    fn submit(&self, asset_id: &str, kind: TaskKind) -> Result<()> {
        self.submitted.lock().push((asset_id.to_string(), kind));
        Ok(())
    }
}

struct Fixture {
    _db_dir: TempDir,
    media: TempDir,
    store: Arc<AssetStore>,
    sink: Arc<RecordingSink>,
    hub: Arc<EventHub>,
}

impl Fixture {
    fn new() -> Self {
        let db_dir = TempDir::new().unwrap();
        let pool = Arc::new(DbPool::open(&get_db_path(db_dir.path()), 4).unwrap());
        let store = Arc::new(AssetStore::open(pool, StoreOptions::default()).unwrap());
        Self {
            _db_dir: db_dir,
            media: TempDir::new().unwrap(),
            store,
            sink: Arc::new(RecordingSink::default()),
            hub: Arc::new(EventHub::new(1_024)),
        }
    }

    fn root(&self) -> RegisteredRoot {
        RegisteredRoot::new(self.media.path(), Scope::Global)
    }

    fn ingestor(&self, roots: Vec<RegisteredRoot>) -> Ingestor {
        Ingestor::new(self.store.clone(), self.sink.clone(), self.hub.clone(), roots)
    }

    fn write(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root().path.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }
}

fn status_of(store: &AssetStore, path: &Path) -> Vec<AssetStatus> {
    store.get_by_path(path).unwrap().into_iter().map(|a| a.status).collect()
}

fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

// ---------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------

#[test]
fn test_scan_creates_rows_and_rescan_is_quiet() {
    let fx = Fixture::new();
    fx.write("a.jpg", b"aaaa");
    fx.write("sub/b.mp4", b"bbbbbb");
    fx.write("sub/deeper/c.psd", b"c");
    let root = fx.root();
    let ingestor = fx.ingestor(vec![root.clone()]);

    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert!(report.completed);
    assert_eq!(report.seen, 3);
    assert_eq!(report.created, 3);
    assert_eq!(report.missing, 0);
    assert_eq!(fx.store.count().unwrap(), 3);
    // Parse and fingerprint for each new asset
    assert_eq!(fx.sink.submitted.lock().len(), 6);

    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert_eq!(report.seen, 3);
    assert_eq!(report.created, 0);
    assert_eq!(report.changed, 0);
    assert_eq!(report.unchanged, 3);
    assert_eq!(fx.sink.submitted.lock().len(), 6);
}

#[test]
fn test_scan_detects_changed_file() {
    let fx = Fixture::new();
    let path = fx.write("a.jpg", b"aaaa");
    let root = fx.root();
    let ingestor = fx.ingestor(vec![root.clone()]);
    scan_root(&ingestor, &root, &CancelToken::new()).unwrap();

    let asset = fx.store.get_by_path(&path).unwrap().remove(0);
    fx.store.mark_indexing(&asset.id).unwrap();

    fs::write(&path, b"aaaaaaaa").unwrap();
    set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

    let events = fx.hub.subscribe(TopicFilter::All);
    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert_eq!(report.changed, 1);

    let again = fx.store.get(&asset.id).unwrap().unwrap();
    assert_eq!(again.status, AssetStatus::New);
    assert_eq!(again.size, 8);
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, Event::AssetChanged { asset_id, .. } if *asset_id == asset.id)));
}

#[test]
fn test_deleted_file_goes_missing_on_next_scan() {
    let fx = Fixture::new();
    let keep = fx.write("keep.jpg", b"k");
    let gone = fx.write("gone.jpg", b"g");
    let root = fx.root();
    let ingestor = fx.ingestor(vec![root.clone()]);
    scan_root(&ingestor, &root, &CancelToken::new()).unwrap();

    fs::remove_file(&gone).unwrap();
    let events = fx.hub.subscribe(TopicFilter::All);
    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();

    assert_eq!(report.missing, 1);
    assert_eq!(status_of(&fx.store, &gone), vec![AssetStatus::Missing]);
    assert_eq!(status_of(&fx.store, &keep), vec![AssetStatus::New]);
    let events = events.drain();
    assert!(events.iter().any(|e| matches!(e, Event::AssetMissing { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ScanFinished { missing: 1, completed: true, .. })));

    // Already missing: not reported twice
    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert_eq!(report.missing, 0);
}

#[test]
fn test_returning_file_is_reset() {
    let fx = Fixture::new();
    let path = fx.write("back.jpg", b"v1");
    let root = fx.root();
    let ingestor = fx.ingestor(vec![root.clone()]);
    scan_root(&ingestor, &root, &CancelToken::new()).unwrap();

    fs::remove_file(&path).unwrap();
    scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert_eq!(status_of(&fx.store, &path), vec![AssetStatus::Missing]);

    fx.write("back.jpg", b"v1");
    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(status_of(&fx.store, &path), vec![AssetStatus::New]);
}

#[test]
fn test_ignore_rules_apply_to_scan() {
    let fx = Fixture::new();
    let kept = fx.write("photos/IMG_0001.JPG", b"x");
    fx.write(".hidden.jpg", b"x");
    fx.write(".cache/a.jpg", b"x");
    fx.write("node_modules/pkg/icon.png", b"x");
    fx.write("Thumbs.db", b"x");
    fx.write("~$draft.docx", b"x");
    fx.write("download.mp4.part", b"x");
    let root = fx.root();
    let ingestor = fx.ingestor(vec![root.clone()]);

    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert_eq!(report.seen, 1);
    assert_eq!(fx.store.count().unwrap(), 1);
    assert_eq!(status_of(&fx.store, &kept), vec![AssetStatus::New]);
}

#[test]
fn test_scopes_are_tracked_separately() {
    let fx = Fixture::new();
    let path = fx.write("shared.png", b"x");
    let global = fx.root();
    let private = RegisteredRoot::new(fx.media.path(), Scope::private("p1"));
    let ingestor = fx.ingestor(vec![global.clone(), private.clone()]);

    scan_root(&ingestor, &global, &CancelToken::new()).unwrap();
    scan_root(&ingestor, &private, &CancelToken::new()).unwrap();

    let rows = fx.store.get_by_path(&path).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|a| a.scope == Scope::Global));
    assert!(rows.iter().any(|a| a.scope == Scope::private("p1")));

    // Deleting it and rescanning one scope leaves the other alone
    fs::remove_file(&path).unwrap();
    scan_root(&ingestor, &private, &CancelToken::new()).unwrap();
    let rows = fx.store.get_by_path(&path).unwrap();
    let by_scope = |s: &Scope| rows.iter().find(|a| &a.scope == s).unwrap().status;
    assert_eq!(by_scope(&Scope::private("p1")), AssetStatus::Missing);
    assert_eq!(by_scope(&Scope::Global), AssetStatus::New);
}

#[test]
fn test_cancelled_scan_does_not_reconcile() {
    let fx = Fixture::new();
    let path = fx.write("a.jpg", b"x");
    let root = fx.root();
    let ingestor = fx.ingestor(vec![root.clone()]);
    scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    fs::remove_file(&path).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = scan_root(&ingestor, &root, &cancel).unwrap();
    assert!(!report.completed);
    assert_eq!(report.missing, 0);
    assert_eq!(status_of(&fx.store, &path), vec![AssetStatus::New]);
}

#[test]
fn test_unreadable_root_marks_nothing() {
    let fx = Fixture::new();
    let path = fx.write("library/a.jpg", b"x");
    let root = RegisteredRoot::new(fx.media.path().join("library"), Scope::Global);
    let ingestor = fx.ingestor(vec![root.clone()]);
    scan_root(&ingestor, &root, &CancelToken::new()).unwrap();

    // Unmounted drive: the whole root disappears
    fs::remove_dir_all(&root.path).unwrap();
    let report = scan_root(&ingestor, &root, &CancelToken::new()).unwrap();
    assert!(report.errors >= 1);
    assert_eq!(report.missing, 0);
    assert_eq!(status_of(&fx.store, &path), vec![AssetStatus::New]);
}

// ---------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------

#[test]
fn test_roots_for_prefers_deepest_root_per_scope() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.media.path().join("inner")).unwrap();
    let outer = fx.root();
    let inner = RegisteredRoot::new(fx.media.path().join("inner"), Scope::Global);
    let project = RegisteredRoot::new(fx.media.path(), Scope::private("p1"));
    let ingestor = fx.ingestor(vec![outer.clone(), inner.clone(), project.clone()]);

    let roots = ingestor.roots_for(&inner.path.join("x.jpg"));
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0], &inner);
    assert!(roots.contains(&&project));

    assert!(ingestor.roots_for(Path::new("/definitely/elsewhere.jpg")).is_empty());
}

#[test]
fn test_observe_path_skips_ignored_and_vanished() {
    let fx = Fixture::new();
    let ingestor = fx.ingestor(vec![fx.root()]);

    let hidden = fx.write(".secret.jpg", b"x");
    assert_eq!(ingestor.observe_path(&hidden).unwrap(), 0);
    assert_eq!(ingestor.observe_path(&fx.root().path.join("nope.jpg")).unwrap(), 0);

    let real = fx.write("real.jpg", b"x");
    assert_eq!(ingestor.observe_path(&real).unwrap(), 1);
    assert_eq!(fx.store.count().unwrap(), 1);
}

#[test]
fn test_observe_removed_directory() {
    let fx = Fixture::new();
    let a = fx.write("trip/a.jpg", b"a");
    let b = fx.write("trip/day2/b.jpg", b"b");
    let other = fx.write("trip2/c.jpg", b"c");
    let ingestor = fx.ingestor(vec![fx.root()]);
    ingestor.observe_dir(&fx.root().path).unwrap();
    assert_eq!(fx.store.count().unwrap(), 3);

    fs::remove_dir_all(fx.root().path.join("trip")).unwrap();
    assert_eq!(ingestor.observe_removed(&fx.root().path.join("trip")).unwrap(), 2);
    assert_eq!(status_of(&fx.store, &a), vec![AssetStatus::Missing]);
    assert_eq!(status_of(&fx.store, &b), vec![AssetStatus::Missing]);
    assert_eq!(status_of(&fx.store, &other), vec![AssetStatus::New]);
}

// ---------------------------------------------------------------
// Scan service and watcher
// ---------------------------------------------------------------

#[test]
fn test_scan_service_startup_and_requests() {
    let fx = Fixture::new();
    fx.write("a.jpg", b"x");
    let ingestor = Arc::new(fx.ingestor(vec![fx.root()]));

    let service = ScanService::start(
        ingestor,
        ScanOptions {
            startup_scan: true,
            rescan_interval: None,
        },
    )
    .unwrap();
    assert!(wait_for(Duration::from_secs(5), || service.progress().scans_completed >= 1));
    assert_eq!(fx.store.count().unwrap(), 1);

    fx.write("b.jpg", b"x");
    service.request_scan(Vec::new()).unwrap();
    assert!(wait_for(Duration::from_secs(5), || fx.store.count().unwrap() == 2));
    assert!(wait_for(Duration::from_secs(5), || !service.progress().running));
    service.stop();
}

#[cfg(target_os = "linux")]
#[test]
fn test_watcher_picks_up_changes() {
    let fx = Fixture::new();
    let ingestor = Arc::new(fx.ingestor(vec![fx.root()]));
    let watcher = WatchService::start(ingestor, None, Duration::from_millis(50)).unwrap();

    let path = fx.write("new.jpg", b"hello");
    assert!(wait_for(Duration::from_secs(5), || status_of(&fx.store, &path)
        == vec![AssetStatus::New]));

    fs::remove_file(&path).unwrap();
    assert!(wait_for(Duration::from_secs(5), || status_of(&fx.store, &path)
        == vec![AssetStatus::Missing]));

    // Directories moved in are walked
    let staging = TempDir::new_in(fx.media.path().parent().unwrap()).unwrap();
    fs::write(staging.path().join("x.png"), b"x").unwrap();
    let moved = fx.root().path.join("album");
    fs::rename(staging.path(), &moved).unwrap();
    assert!(wait_for(Duration::from_secs(5), || status_of(&fx.store, &moved.join("x.png"))
        == vec![AssetStatus::New]));

    watcher.stop();
}
