// Task execution for media queue workers.
//
// One claimed task in, one settled task out. A parser panic is caught here and
// recorded as a permanent failure so the worker thread never dies. A cancelled
// task (shutdown) is left PROCESSING for startup recovery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::db::schema::{now_millis, Asset, AssetStatus, MediaTask, TaskKind, TaskStatus};
use crate::error::{MediaError, Result};
use crate::events::{Event, EventPublisher};
use crate::hash::compute_fingerprint;
use crate::ingest::FileStamp;
use crate::jobs::cancel::CancelToken;
use crate::metadata::ParseOutput;
use crate::parsers::ParserRegistry;
use crate::store::{AssetStore, RecordOutcome};

/// Everything a worker needs, shared by all workers of one queue
pub struct WorkerContext {
    pub store: Arc<AssetStore>,
    pub registry: Arc<ParserRegistry>,
    pub publisher: Arc<dyn EventPublisher>,
    pub parse_deadline: Duration,
    pub retry_backoff: Duration,
}

/// How a task ended, from the worker's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Done,
    Retried,
    Failed,
    /// Shutdown interrupted the task; it stays PROCESSING
    Abandoned,
}

impl WorkerContext {
    /// `not_before` for the n-th retry: backoff × 2^(n-1)
    pub fn retry_at(&self, attempts: i64, now: i64) -> i64 {
        let exp = attempts.clamp(1, 16) as u32 - 1;
        let delay = (self.retry_backoff.as_millis() as i64).saturating_mul(1i64 << exp);
        now.saturating_add(delay)
    }

    /// Run one claimed task to a settled state
    pub fn run(&self, task: &MediaTask, root: &CancelToken) -> Result<TaskResult> {
        log::debug!("Task {} claimed: {} {}", task.id, task.kind, task.asset_id);
        self.publisher.publish(Event::TaskStarted {
            task_id: task.id,
            asset_id: task.asset_id.clone(),
            kind: task.kind,
        });

        let asset = match self.store.get(&task.asset_id)? {
            Some(asset) => asset,
            None => {
                let err = MediaError::AssetNotFound(task.asset_id.clone());
                return self.finish_failed(task, &err);
            }
        };

        match task.kind {
            TaskKind::Parse => self.run_parse(task, &asset, root),
            TaskKind::Fingerprint => self.run_fingerprint(task, &asset, root),
            TaskKind::Thumbnail => self.run_thumbnail(task, &asset, root),
        }
    }

    fn run_parse(&self, task: &MediaTask, asset: &Asset, root: &CancelToken) -> Result<TaskResult> {
        if !self.store.mark_indexing(&asset.id)? {
            // Indexed, failed or missing since the task was queued
            log::debug!("Asset {} is {}, nothing to parse", asset.id, asset.status);
            return self.finish_done(task);
        }
        self.publisher.publish(Event::AssetStatusChanged {
            asset_id: asset.id.clone(),
            status: AssetStatus::Indexing,
            error: None,
        });

        let deadline = root.child_with_timeout(self.parse_deadline);
        let result = guarded_parse(&self.registry, Path::new(&asset.path), &asset.extension(), &deadline);

        if let Err(e) = &result {
            if e.is_cancelled() {
                log::info!("Parse of {} interrupted by shutdown", asset.path);
                return Ok(TaskResult::Abandoned);
            }
        }

        match self.store.record_parse_result(&asset.id, result.as_ref())? {
            RecordOutcome::Indexed => {
                self.publisher.publish(Event::AssetStatusChanged {
                    asset_id: asset.id.clone(),
                    status: AssetStatus::Indexed,
                    error: None,
                });
                self.finish_done(task)
            }
            RecordOutcome::Stale => {
                log::debug!("Discarding stale parse result for {}", asset.path);
                self.finish_done(task)
            }
            RecordOutcome::Retry { attempts } => {
                let message = error_text(&result);
                log::warn!(
                    "Parse of {} failed (attempt {}), will retry: {}",
                    asset.path,
                    attempts,
                    message
                );
                self.publisher.publish(Event::AssetStatusChanged {
                    asset_id: asset.id.clone(),
                    status: AssetStatus::New,
                    error: Some(message.clone()),
                });
                self.schedule_retry(task, &message, attempts)
            }
            RecordOutcome::Failed { attempts } => {
                let message = error_text(&result);
                log::error!("Parse of {} failed after {} attempts: {}", asset.path, attempts, message);
                self.publisher.publish(Event::AssetStatusChanged {
                    asset_id: asset.id.clone(),
                    status: AssetStatus::Failed,
                    error: Some(message.clone()),
                });
                self.finish_failed(task, &MediaError::Other(message))
            }
        }
    }

    fn run_fingerprint(&self, task: &MediaTask, asset: &Asset, root: &CancelToken) -> Result<TaskResult> {
        if asset.status == AssetStatus::Missing || asset.fingerprint.is_some() {
            return self.finish_done(task);
        }

        let path = Path::new(&asset.path);
        let stamp = match FileStamp::read(path) {
            Ok(stamp) => stamp,
            Err(e) => return self.settle_error(task, &MediaError::Io(e)),
        };
        if stamp.size != asset.size || stamp.mtime != asset.mtime {
            // The change will be observed and fingerprinted again
            log::debug!("{} changed since it was queued for hashing", asset.path);
            return self.finish_done(task);
        }

        let cancel = root.child();
        let fingerprint = match compute_fingerprint(path, &cancel) {
            Ok(fp) => fp,
            Err(e) if e.is_cancelled() => return Ok(TaskResult::Abandoned),
            Err(e) => return self.settle_error(task, &e),
        };

        let outcome = self.store.set_fingerprint(&asset.id, &fingerprint, stamp.size, stamp.mtime)?;
        if let Some(original) = outcome.duplicate_of {
            log::info!("{} is an exact duplicate of asset {}", asset.path, original);
            self.publisher.publish(Event::AssetDuplicate {
                asset_id: asset.id.clone(),
                duplicate_of: original,
                fingerprint,
            });
        }
        self.finish_done(task)
    }

    fn run_thumbnail(&self, task: &MediaTask, asset: &Asset, root: &CancelToken) -> Result<TaskResult> {
        if asset.status != AssetStatus::Indexed {
            log::debug!("Asset {} is {}, skipping thumbnail", asset.id, asset.status);
            return self.finish_done(task);
        }

        let deadline = root.child_with_timeout(self.parse_deadline);
        let output = match guarded_parse(&self.registry, Path::new(&asset.path), &asset.extension(), &deadline) {
            Ok(out) => out,
            Err(e) if e.is_cancelled() => return Ok(TaskResult::Abandoned),
            Err(e) => return self.settle_error(task, &e),
        };

        match output.thumbnail.filter(|b| !b.is_empty()) {
            Some(bytes) => {
                if !self.store.replace_thumbnail(&asset.id, &bytes)? {
                    log::debug!("Asset {} changed before its thumbnail was stored", asset.id);
                }
                self.finish_done(task)
            }
            None => {
                let reason = output
                    .metadata
                    .extra_str("thumbnail_error")
                    .unwrap_or("parser produced no thumbnail")
                    .to_string();
                self.finish_failed(task, &MediaError::Parse(reason))
            }
        }
    }

    /// Retry transient errors until the attempt limit, fail the rest
    fn settle_error(&self, task: &MediaTask, err: &MediaError) -> Result<TaskResult> {
        let attempts = task.attempts + 1;
        if err.is_transient() && attempts < self.store.max_parse_attempts() {
            log::warn!("Task {} failed (attempt {}), will retry: {}", task.id, attempts, err);
            return self.schedule_retry(task, &err.to_string(), attempts);
        }
        self.finish_failed(task, err)
    }

    fn schedule_retry(&self, task: &MediaTask, message: &str, attempts: i64) -> Result<TaskResult> {
        let not_before = self.retry_at(attempts, now_millis());
        self.store.retry_task(task.id, message, not_before)?;
        self.publisher.publish(Event::TaskRetryScheduled {
            task_id: task.id,
            asset_id: task.asset_id.clone(),
            kind: task.kind,
            attempts,
            not_before,
        });
        Ok(TaskResult::Retried)
    }

    fn finish_done(&self, task: &MediaTask) -> Result<TaskResult> {
        self.store.complete_task(task.id)?;
        self.publisher.publish(Event::TaskFinished {
            task_id: task.id,
            asset_id: task.asset_id.clone(),
            kind: task.kind,
            status: TaskStatus::Done,
            error: None,
        });
        Ok(TaskResult::Done)
    }

    fn finish_failed(&self, task: &MediaTask, err: &MediaError) -> Result<TaskResult> {
        let message = err.to_string();
        log::warn!("Task {} ({} {}) failed: {}", task.id, task.kind, task.asset_id, message);
        self.store.fail_task(task.id, &message)?;
        self.publisher.publish(Event::TaskFinished {
            task_id: task.id,
            asset_id: task.asset_id.clone(),
            kind: task.kind,
            status: TaskStatus::Failed,
            error: Some(message),
        });
        Ok(TaskResult::Failed)
    }
}

/// Run the registry, turning a parser panic into a permanent error
fn guarded_parse(
    registry: &ParserRegistry,
    path: &Path,
    extension: &str,
    cancel: &CancelToken,
) -> Result<ParseOutput> {
    match catch_unwind(AssertUnwindSafe(|| registry.process(path, extension, cancel))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            log::error!("Parser panicked on {}: {}", path.display(), msg);
            Err(MediaError::Other(format!("Parser panicked: {}", msg)))
        }
    }
}

fn error_text(result: &Result<ParseOutput>) -> String {
    match result {
        Err(e) => e.to_string(),
        Ok(_) => "parser returned no format".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::get_db_path;
    use crate::db::schema::Scope;
    use crate::db::DbPool;
    use crate::events::{EventHub, TopicFilter};
    use crate::metadata::MediaMetadata;
    use crate::parsers::Parser;
    use crate::store::StoreOptions;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted parser: fails with the given error for the first `fail_times` calls
    struct Scripted {
        calls: AtomicUsize,
        fail_times: usize,
        error: fn() -> MediaError,
        panic: bool,
    }

    impl Parser for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn can_handle(&self, _extension: &str) -> bool {
            true
        }

        fn parse(&self, _path: &Path, _cancel: &CancelToken) -> Result<ParseOutput> {
            if self.panic {
                panic!("boom");
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err((self.error)());
            }
            Ok(ParseOutput {
                metadata: MediaMetadata::with_format("JPEG"),
                thumbnail: Some(b"\x89PNG\r\n\x1a\n".to_vec()),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        ctx: WorkerContext,
        hub: Arc<EventHub>,
    }

    fn fixture(parser: Scripted) -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(DbPool::open(&get_db_path(dir.path()), 4).unwrap());
        let store = Arc::new(AssetStore::open(pool, StoreOptions::default()).unwrap());
        let registry = Arc::new(ParserRegistry::new());
        registry.register(Arc::new(parser), 1);
        let hub = Arc::new(EventHub::new(1024));
        let publisher: Arc<dyn EventPublisher> = hub.clone();
        let ctx = WorkerContext {
            store,
            registry,
            publisher,
            parse_deadline: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
        };
        Fixture { _dir: dir, ctx, hub }
    }

    fn scripted(fail_times: usize, error: fn() -> MediaError) -> Scripted {
        Scripted { calls: AtomicUsize::new(0), fail_times, error, panic: false }
    }

    fn claim_parse(ctx: &WorkerContext, path: &str) -> (String, MediaTask) {
        let (asset, _) = ctx.store.upsert(&PathBuf::from(path), 1, 1, &Scope::Global).unwrap();
        ctx.store.enqueue_task(&asset.id, TaskKind::Parse).unwrap();
        let task = ctx.store.claim_next_task().unwrap().unwrap();
        (asset.id, task)
    }

    #[test]
    fn test_parse_success_indexes_and_publishes() {
        let f = fixture(scripted(0, || MediaError::DeadlineExceeded));
        let sub = f.hub.subscribe(TopicFilter::All);
        let (id, task) = claim_parse(&f.ctx, "/r/a.jpg");

        let result = f.ctx.run(&task, &CancelToken::new()).unwrap();
        assert_eq!(result, TaskResult::Done);

        let asset = f.ctx.store.get(&id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Indexed);
        assert_eq!(f.ctx.store.tasks_for_asset(&id).unwrap()[0].status, TaskStatus::Done);

        let types: Vec<&str> = sub.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["task.started", "asset.status_changed", "asset.status_changed", "task.finished"]
        );
    }

    #[test]
    fn test_transient_error_schedules_backoff() {
        let f = fixture(scripted(1, || MediaError::DeadlineExceeded));
        let (id, task) = claim_parse(&f.ctx, "/r/a.mp4");

        let before = now_millis();
        assert_eq!(f.ctx.run(&task, &CancelToken::new()).unwrap(), TaskResult::Retried);

        let retried = f.ctx.store.tasks_for_asset(&id).unwrap().remove(0);
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.not_before >= before + 10);
        assert_eq!(f.ctx.store.get(&id).unwrap().unwrap().status, AssetStatus::New);

        // Claimable again after the backoff, and succeeds the second time
        std::thread::sleep(Duration::from_millis(30));
        let again = f.ctx.store.claim_next_task().unwrap().unwrap();
        assert_eq!(f.ctx.run(&again, &CancelToken::new()).unwrap(), TaskResult::Done);
        assert_eq!(f.ctx.store.get(&id).unwrap().unwrap().status, AssetStatus::Indexed);
    }

    #[test]
    fn test_permanent_error_fails_task_and_asset() {
        let f = fixture(scripted(1, || MediaError::Parse("corrupt".into())));
        let (id, task) = claim_parse(&f.ctx, "/r/a.jpg");
        assert_eq!(f.ctx.run(&task, &CancelToken::new()).unwrap(), TaskResult::Failed);

        let asset = f.ctx.store.get(&id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Failed);
        assert!(asset.last_error.unwrap().contains("corrupt"));
        assert_eq!(f.ctx.store.tasks_for_asset(&id).unwrap()[0].status, TaskStatus::Failed);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let mut parser = scripted(0, || MediaError::DeadlineExceeded);
        parser.panic = true;
        let f = fixture(parser);
        let (id, task) = claim_parse(&f.ctx, "/r/a.jpg");

        assert_eq!(f.ctx.run(&task, &CancelToken::new()).unwrap(), TaskResult::Failed);
        let asset = f.ctx.store.get(&id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Failed);
        assert!(asset.last_error.unwrap().contains("boom"));
    }

    #[test]
    fn test_shutdown_leaves_task_processing() {
        let f = fixture(scripted(1, || MediaError::Cancelled));
        let (id, task) = claim_parse(&f.ctx, "/r/a.jpg");
        assert_eq!(f.ctx.run(&task, &CancelToken::new()).unwrap(), TaskResult::Abandoned);
        assert_eq!(f.ctx.store.tasks_for_asset(&id).unwrap()[0].status, TaskStatus::Processing);
        assert_eq!(f.ctx.store.get(&id).unwrap().unwrap().status, AssetStatus::Indexing);
    }

    #[test]
    fn test_parse_of_indexed_asset_is_noop() {
        let f = fixture(scripted(0, || MediaError::DeadlineExceeded));
        let (id, task) = claim_parse(&f.ctx, "/r/a.jpg");
        f.ctx.run(&task, &CancelToken::new()).unwrap();

        f.ctx.store.enqueue_task(&id, TaskKind::Parse).unwrap();
        let again = f.ctx.store.claim_next_task().unwrap().unwrap();
        assert_eq!(f.ctx.run(&again, &CancelToken::new()).unwrap(), TaskResult::Done);
        assert_eq!(f.ctx.store.get(&id).unwrap().unwrap().status, AssetStatus::Indexed);
    }

    #[test]
    fn test_fingerprint_task_links_duplicates() {
        let f = fixture(scripted(0, || MediaError::DeadlineExceeded));
        let dir = TempDir::new().unwrap();
        let mut ids = Vec::new();
        for name in ["a.bin", "b.bin"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"same bytes").unwrap();
            let stamp = FileStamp::read(&path).unwrap();
            let (asset, _) = f.ctx.store.upsert(&path, stamp.size, stamp.mtime, &Scope::Global).unwrap();
            f.ctx.store.enqueue_task(&asset.id, TaskKind::Fingerprint).unwrap();
            ids.push(asset.id);
        }

        let sub = f.hub.subscribe(TopicFilter::All);
        for _ in 0..2 {
            let task = f.ctx.store.claim_next_task().unwrap().unwrap();
            assert_eq!(f.ctx.run(&task, &CancelToken::new()).unwrap(), TaskResult::Done);
        }

        let second = f.ctx.store.get(&ids[1]).unwrap().unwrap();
        assert!(second.fingerprint.unwrap().starts_with("blake3:full:"));
        assert_eq!(second.parent_asset_id.as_deref(), Some(ids[0].as_str()));
        assert!(sub.drain().iter().any(|e| e.event_type() == "asset.duplicate"));
    }

    #[test]
    fn test_fingerprint_of_vanished_file_retries() {
        let f = fixture(scripted(0, || MediaError::DeadlineExceeded));
        let (asset, _) = f.ctx.store.upsert(&PathBuf::from("/nonexistent/x.bin"), 1, 1, &Scope::Global).unwrap();
        f.ctx.store.enqueue_task(&asset.id, TaskKind::Fingerprint).unwrap();
        let task = f.ctx.store.claim_next_task().unwrap().unwrap();
        assert_eq!(f.ctx.run(&task, &CancelToken::new()).unwrap(), TaskResult::Retried);
    }

    #[test]
    fn test_thumbnail_task_replaces_thumbnail() {
        let f = fixture(scripted(0, || MediaError::DeadlineExceeded));
        let (id, task) = claim_parse(&f.ctx, "/r/a.jpg");
        f.ctx.run(&task, &CancelToken::new()).unwrap();

        f.ctx.store.enqueue_task(&id, TaskKind::Thumbnail).unwrap();
        let thumb_task = f.ctx.store.claim_next_task().unwrap().unwrap();
        assert_eq!(thumb_task.kind, TaskKind::Thumbnail);
        assert_eq!(f.ctx.run(&thumb_task, &CancelToken::new()).unwrap(), TaskResult::Done);
        assert_eq!(f.ctx.store.thumbnail(&id).unwrap().unwrap().mime, "image/png");
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let f = fixture(scripted(0, || MediaError::DeadlineExceeded));
        assert_eq!(f.ctx.retry_at(1, 1_000), 1_010);
        assert_eq!(f.ctx.retry_at(2, 1_000), 1_020);
        assert_eq!(f.ctx.retry_at(3, 1_000), 1_040);
    }
}
