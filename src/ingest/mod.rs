// Ingest pipeline module
//
// The scanner and the watcher both funnel observations through `Ingestor`:
// bloom probe, create-or-upsert, task submission and event publication.

pub mod filters;
pub mod scan;
pub mod watcher;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::config::RootConfig;
use crate::db::schema::{Asset, AssetStatus, Scope, TaskKind};
use crate::error::Result;
use crate::events::{Event, EventPublisher};
use crate::jobs::TaskSink;
use crate::store::{AssetStore, UpsertKind};

/// Size and modification time as stored on the asset row.
/// `mtime` is nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: i64,
    pub mtime: i64,
}

impl FileStamp {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let mtime = match meta.modified() {
            Ok(t) => match t.duration_since(UNIX_EPOCH) {
                Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
                Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
            },
            Err(_) => 0,
        };
        Self {
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
            mtime,
        }
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        Ok(Self::from_metadata(&fs::metadata(path)?))
    }
}

/// A root directory with the scope its assets are recorded under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredRoot {
    pub path: PathBuf,
    pub scope: Scope,
}

impl RegisteredRoot {
    pub fn new(path: impl Into<PathBuf>, scope: Scope) -> Self {
        let path = path.into();
        // Watch events arrive with resolved paths
        let path = fs::canonicalize(&path).unwrap_or(path);
        Self { path, scope }
    }

    pub fn from_config(config: &RootConfig) -> Result<Self> {
        Ok(Self::new(config.path.clone(), config.to_scope()?))
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

pub struct Ingestor {
    store: Arc<AssetStore>,
    sink: Arc<dyn TaskSink>,
    publisher: Arc<dyn EventPublisher>,
    roots: Vec<RegisteredRoot>,
}

impl Ingestor {
    pub fn new(
        store: Arc<AssetStore>,
        sink: Arc<dyn TaskSink>,
        publisher: Arc<dyn EventPublisher>,
        roots: Vec<RegisteredRoot>,
    ) -> Self {
        Self { store, sink, publisher, roots }
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.publisher
    }

    pub fn roots(&self) -> &[RegisteredRoot] {
        &self.roots
    }

    /// Every registered root containing `path`; one per scope it is tracked in
    pub fn roots_for(&self, path: &Path) -> Vec<&RegisteredRoot> {
        let mut matches: Vec<&RegisteredRoot> = self.roots.iter().filter(|r| r.contains(path)).collect();
        // Nested roots with the same scope: the deepest one wins
        matches.sort_by_key(|r| std::cmp::Reverse(r.path.components().count()));
        let mut unique: Vec<&RegisteredRoot> = Vec::new();
        for root in matches {
            if !unique.iter().any(|u| u.scope == root.scope) {
                unique.push(root);
            }
        }
        unique
    }

    /// Record one regular file in `scope`. A bloom miss goes straight to
    /// insert; a hit needs the full upsert.
    pub fn observe_file(&self, path: &Path, stamp: FileStamp, scope: &Scope) -> Result<(Asset, UpsertKind)> {
        let (asset, kind) = if self.store.bloom_contains_path(path) {
            self.store.upsert(path, stamp.size, stamp.mtime, scope)?
        } else {
            self.store.create_new(path, stamp.size, stamp.mtime, scope)?
        };

        match kind {
            UpsertKind::Created => {
                log::debug!("New asset {} ({})", asset.path, asset.id);
                self.publisher.publish(Event::AssetCreated {
                    asset_id: asset.id.clone(),
                    path: asset.path.clone(),
                });
            }
            UpsertKind::Changed => {
                log::debug!("Changed asset {} ({})", asset.path, asset.id);
                self.publisher.publish(Event::AssetChanged {
                    asset_id: asset.id.clone(),
                    path: asset.path.clone(),
                });
                self.publisher.publish(Event::AssetStatusChanged {
                    asset_id: asset.id.clone(),
                    status: AssetStatus::New,
                    error: None,
                });
            }
            UpsertKind::Unchanged => {}
        }

        if kind.needs_parse() {
            self.sink.submit(&asset.id, TaskKind::Parse)?;
            self.sink.submit(&asset.id, TaskKind::Fingerprint)?;
        }
        Ok((asset, kind))
    }

    /// Stat and record a file for every root that contains it.
    /// Ignored or vanished paths are skipped.
    pub fn observe_path(&self, path: &Path) -> Result<usize> {
        let stamp = match FileStamp::read(path) {
            Ok(stamp) => stamp,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut observed = 0;
        for root in self.roots_for(path) {
            if filters::is_ignored_path(&root.path, path) {
                continue;
            }
            self.observe_file(path, stamp, &root.scope)?;
            observed += 1;
        }
        Ok(observed)
    }

    /// Walk a directory that appeared under a root and record its files
    pub fn observe_dir(&self, dir: &Path) -> Result<usize> {
        let mut observed = 0;
        for entry in WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !filters::is_ignored_entry(e))
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                observed += self.observe_path(entry.path())?;
            }
        }
        Ok(observed)
    }

    /// A path disappeared. It may have been a file or a whole directory.
    pub fn observe_removed(&self, path: &Path) -> Result<usize> {
        let mut gone = self.store.mark_missing(path)?;
        gone.extend(self.store.mark_missing_under(path)?);
        for asset in &gone {
            self.publish_missing(&asset.id, &asset.path);
        }
        Ok(gone.len())
    }

    pub(crate) fn publish_missing(&self, asset_id: &str, path: &str) {
        log::info!("Asset missing: {} ({})", path, asset_id);
        self.publisher.publish(Event::AssetMissing {
            asset_id: asset_id.to_string(),
            path: path.to_string(),
        });
    }
}

#[cfg(test)]
mod tests;
