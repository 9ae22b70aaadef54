// Asset store
//
// System of record for assets. Owns the asset, thumbnail and task rows and the
// in-memory path bloom filter. All writes that read-then-modify a row run in
// IMMEDIATE transactions so concurrent producers serialize on the row.

pub mod bloom;
pub mod event_log;
pub mod tasks;

use std::collections::HashMap;
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::constants::{BLOOM_CAPACITY_FACTOR, BLOOM_MIN_CAPACITY, DEFAULT_BLOOM_FPR, DEFAULT_MAX_PARSE_ATTEMPTS};
use crate::db::schema::{
    asset_from_row, now_millis, Asset, AssetStatus, MediaTask, Scope, TaskKind, TaskStatus,
    Thumbnail, ASSET_COLUMNS,
};
use crate::db::DbPool;
use crate::error::{MediaError, Result};
use crate::hash::{dhash_from_hex, hamming_distance, PathHash};
use crate::metadata::{thumbnail_mime, ParseOutput};

use bloom::BloomFilter;

/// Canonical string key for a filesystem path
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// What an upsert did to the row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertKind {
    Created,
    /// Size or mtime moved, or a MISSING file came back. Reset to NEW.
    Changed,
    Unchanged,
}

impl UpsertKind {
    /// Created or changed rows need a fresh parse
    pub fn needs_parse(&self) -> bool {
        !matches!(self, UpsertKind::Unchanged)
    }
}

/// How a parse result was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordOutcome {
    Indexed,
    /// Transient failure below the attempt limit; asset back to NEW
    Retry { attempts: i64 },
    Failed { attempts: i64 },
    /// The asset changed or vanished while parsing; result discarded
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintOutcome {
    pub stored: bool,
    /// Oldest other asset with the same content
    pub duplicate_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimilarAsset {
    pub asset_id: String,
    pub path: String,
    pub distance: u32,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_parse_attempts: i64,
    pub bloom_false_positive_rate: f64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_parse_attempts: DEFAULT_MAX_PARSE_ATTEMPTS,
            bloom_false_positive_rate: DEFAULT_BLOOM_FPR,
        }
    }
}

pub struct AssetStore {
    pool: Arc<DbPool>,
    bloom: BloomFilter,
    options: StoreOptions,
}

impl AssetStore {
    /// Open the store and rebuild the bloom filter from every known path
    pub fn open(pool: Arc<DbPool>, options: StoreOptions) -> Result<Self> {
        let paths = {
            let conn = pool.get()?;
            let mut stmt = conn.prepare("SELECT path FROM assets")?;
            let paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            paths
        };

        let capacity = paths.len().max(BLOOM_MIN_CAPACITY) * BLOOM_CAPACITY_FACTOR;
        let bloom = BloomFilter::with_capacity(capacity, options.bloom_false_positive_rate);
        for path in &paths {
            bloom.insert(&PathHash::of(path));
        }

        log::info!(
            "Bloom filter loaded: {} paths, {} bits, {} hashes",
            paths.len(),
            bloom.num_bits(),
            bloom.num_hashes()
        );

        Ok(Self { pool, bloom, options })
    }

    pub fn pool(&self) -> &Arc<DbPool> {
        &self.pool
    }

    pub fn max_parse_attempts(&self) -> i64 {
        self.options.max_parse_attempts
    }

    // ----- Bloom -----

    /// False means the path has never been stored
    pub fn bloom_contains(&self, hash: &PathHash) -> bool {
        self.bloom.contains(hash)
    }

    pub fn bloom_contains_path(&self, path: &Path) -> bool {
        self.bloom.contains(&PathHash::of_path(path))
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    // ----- Observations -----

    /// Create, reset or leave alone the row for (path, scope).
    pub fn upsert(&self, path: &Path, size: i64, mtime: i64, scope: &Scope) -> Result<(Asset, UpsertKind)> {
        let key = path_key(path);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = find_identity(&tx, &key, scope)?;
        let result = match existing {
            None => {
                let asset = insert_new(&tx, &key, size, mtime, scope)?;
                (asset, UpsertKind::Created)
            }
            Some(asset)
                if asset.size == size
                    && asset.mtime == mtime
                    && asset.status != AssetStatus::Missing =>
            {
                (asset, UpsertKind::Unchanged)
            }
            Some(asset) => {
                let now = now_millis();
                tx.execute(
                    "UPDATE assets
                     SET size = ?1, mtime = ?2, status = 'NEW', fingerprint = NULL,
                         metadata = NULL, format = NULL, parent_asset_id = NULL,
                         attempts = 0, last_error = NULL, updated_at = ?3
                     WHERE id = ?4",
                    params![size, mtime, now, asset.id],
                )?;
                tx.execute("DELETE FROM asset_thumbnails WHERE asset_id = ?1", params![asset.id])?;
                let reset = get_asset(&tx, &asset.id)?.ok_or_else(|| MediaError::AssetNotFound(asset.id.clone()))?;
                (reset, UpsertKind::Changed)
            }
        };

        tx.commit()?;

        if result.1 == UpsertKind::Created {
            self.bloom.insert(&PathHash::of(&key));
        }
        Ok(result)
    }

    /// Fast path for bloom-negative observations. Falls back to a full
    /// upsert if the row turns out to exist after all.
    pub fn create_new(&self, path: &Path, size: i64, mtime: i64, scope: &Scope) -> Result<(Asset, UpsertKind)> {
        let key = path_key(path);
        let inserted = {
            let conn = self.pool.get()?;
            let now = now_millis();
            let id = uuid::Uuid::new_v4().to_string();
            let rows = conn.execute(
                "INSERT OR IGNORE INTO assets
                     (id, path, size, mtime, scope, project_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'NEW', ?7, ?7)",
                params![id, key, size, mtime, scope.as_str(), scope.project_id(), now],
            )?;
            if rows == 1 {
                get_asset(&conn, &id)?
            } else {
                None
            }
        };

        match inserted {
            Some(asset) => {
                self.bloom.insert(&PathHash::of(&key));
                Ok((asset, UpsertKind::Created))
            }
            None => self.upsert(path, size, mtime, scope),
        }
    }

    /// Mark every row for `path` MISSING. Returns the assets that transitioned.
    pub fn mark_missing(&self, path: &Path) -> Result<Vec<Asset>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "UPDATE assets SET status = 'MISSING', updated_at = ?1
             WHERE path = ?2 AND status != 'MISSING'
             RETURNING {}",
            ASSET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![now_millis(), path_key(path)], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    /// Mark every row under directory `dir` MISSING
    pub fn mark_missing_under(&self, dir: &Path) -> Result<Vec<Asset>> {
        let conn = self.pool.get()?;
        let prefix = dir_prefix(dir);
        let sql = format!(
            "UPDATE assets SET status = 'MISSING', updated_at = ?1
             WHERE substr(path, 1, length(?2)) = ?2 AND status != 'MISSING'
             RETURNING {}",
            ASSET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![now_millis(), prefix], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    /// Mark one asset MISSING by id. False if it already was.
    pub fn mark_missing_by_id(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let rows = conn.execute(
            "UPDATE assets SET status = 'MISSING', updated_at = ?1
             WHERE id = ?2 AND status != 'MISSING'",
            params![now_millis(), id],
        )?;
        Ok(rows > 0)
    }

    /// Non-MISSING (path -> id) under `root` for one scope. The scanner's
    /// reconciliation snapshot.
    pub fn known_paths_under(&self, root: &Path, scope: &Scope) -> Result<HashMap<String, String>> {
        let conn = self.pool.get()?;
        let prefix = dir_prefix(root);
        let mut stmt = conn.prepare(
            "SELECT path, id FROM assets
             WHERE substr(path, 1, length(?1)) = ?1
               AND scope = ?2 AND IFNULL(project_id, '') = IFNULL(?3, '')
               AND status != 'MISSING'",
        )?;
        let rows = stmt
            .query_map(params![prefix, scope.as_str(), scope.project_id()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    // ----- Parse lifecycle -----

    /// NEW -> INDEXING. Re-entrant for an asset already INDEXING.
    pub fn mark_indexing(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let rows = conn.execute(
            "UPDATE assets SET status = 'INDEXING', updated_at = ?1
             WHERE id = ?2 AND status IN ('NEW', 'INDEXING')",
            params![now_millis(), id],
        )?;
        Ok(rows > 0)
    }

    /// Apply a parser result to an INDEXING asset.
    pub fn record_parse_result(
        &self,
        id: &str,
        result: std::result::Result<&ParseOutput, &MediaError>,
    ) -> Result<RecordOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(AssetStatus, i64)> = tx
            .query_row(
                "SELECT status, attempts FROM assets WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (status, attempts) = row.ok_or_else(|| MediaError::AssetNotFound(id.to_string()))?;
        if status != AssetStatus::Indexing {
            return Ok(RecordOutcome::Stale);
        }

        let now = now_millis();

        // An empty format can never satisfy the INDEXED invariant
        let empty_format = MediaError::Parse("parser returned no format".to_string());
        let checked = match result {
            Ok(out) if out.metadata.format.trim().is_empty() => Err(&empty_format),
            other => other,
        };

        let outcome = match checked {
            Ok(out) => {
                let metadata = serde_json::to_string(&out.metadata)?;
                tx.execute(
                    "UPDATE assets
                     SET status = 'INDEXED', metadata = ?1, format = ?2, last_error = NULL,
                         updated_at = ?3
                     WHERE id = ?4",
                    params![metadata, out.metadata.format.trim(), now, id],
                )?;
                match out.thumbnail.as_deref().filter(|b| !b.is_empty()) {
                    Some(bytes) => upsert_thumbnail(&tx, id, bytes, now)?,
                    None => {
                        tx.execute("DELETE FROM asset_thumbnails WHERE asset_id = ?1", params![id])?;
                    }
                }
                RecordOutcome::Indexed
            }
            Err(err) => {
                let attempts = attempts + 1;
                let give_up = !err.is_transient() || attempts >= self.options.max_parse_attempts;
                let next_status = if give_up { AssetStatus::Failed } else { AssetStatus::New };
                tx.execute(
                    "UPDATE assets SET status = ?1, attempts = ?2, last_error = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![next_status, attempts, err.to_string(), now, id],
                )?;
                if give_up {
                    RecordOutcome::Failed { attempts }
                } else {
                    RecordOutcome::Retry { attempts }
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// NEW assets, oldest first
    pub fn list_pending(&self, limit: usize) -> Result<Vec<Asset>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM assets WHERE status = 'NEW'
             ORDER BY created_at ASC, rowid ASC LIMIT ?1",
            ASSET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![limit as i64], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    /// NEW assets with no active PARSE task, oldest first
    pub fn list_pending_unqueued(&self, limit: usize) -> Result<Vec<Asset>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM assets a WHERE a.status = 'NEW'
               AND NOT EXISTS (
                   SELECT 1 FROM media_tasks t
                   WHERE t.asset_id = a.id AND t.kind = 'PARSE'
                     AND t.status IN ('PENDING', 'PROCESSING')
               )
             ORDER BY a.created_at ASC, a.rowid ASC LIMIT ?1",
            ASSET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![limit as i64], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    // ----- Queries -----

    pub fn get(&self, id: &str) -> Result<Option<Asset>> {
        let conn = self.pool.get()?;
        get_asset(&conn, id)
    }

    /// Every row for a path, one per scope
    pub fn get_by_path(&self, path: &Path) -> Result<Vec<Asset>> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM assets WHERE path = ?1 ORDER BY created_at", ASSET_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![path_key(path)], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    pub fn list(&self, status: Option<AssetStatus>, limit: i64, offset: i64) -> Result<Vec<Asset>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM assets WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, rowid ASC LIMIT ?2 OFFSET ?3",
            ASSET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let assets = stmt
            .query_map(params![status, limit, offset], asset_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    pub fn status_counts(&self) -> Result<Vec<(AssetStatus, i64)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM assets GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        let n = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(n)
    }

    // ----- Fingerprints -----

    /// Store a content fingerprint if the file still matches what was hashed.
    /// Links the asset to the oldest other asset with identical content.
    pub fn set_fingerprint(&self, id: &str, fingerprint: &str, size: i64, mtime: i64) -> Result<FingerprintOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();

        let rows = tx.execute(
            "UPDATE assets SET fingerprint = ?1, updated_at = ?2
             WHERE id = ?3 AND fingerprint IS NULL AND size = ?4 AND mtime = ?5",
            params![fingerprint, now, id, size, mtime],
        )?;
        if rows == 0 {
            tx.commit()?;
            return Ok(FingerprintOutcome { stored: false, duplicate_of: None });
        }

        let original: Option<String> = tx
            .query_row(
                "SELECT id FROM assets WHERE fingerprint = ?1 AND id != ?2
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                params![fingerprint, id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(ref parent) = original {
            tx.execute(
                "UPDATE assets SET parent_asset_id = ?1 WHERE id = ?2",
                params![parent, id],
            )?;
        }

        tx.commit()?;
        Ok(FingerprintOutcome { stored: true, duplicate_of: original })
    }

    // ----- Thumbnails -----

    pub fn thumbnail(&self, id: &str) -> Result<Option<Thumbnail>> {
        let conn = self.pool.get()?;
        let thumb = conn
            .query_row(
                "SELECT asset_id, mime, bytes FROM asset_thumbnails WHERE asset_id = ?1",
                params![id],
                |row| {
                    Ok(Thumbnail {
                        asset_id: row.get(0)?,
                        mime: row.get(1)?,
                        bytes: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(thumb)
    }

    /// Replace the thumbnail of an INDEXED asset without touching metadata.
    /// False if the asset is not INDEXED (anymore).
    pub fn replace_thumbnail(&self, id: &str, bytes: &[u8]) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let status: Option<AssetStatus> = tx
            .query_row("SELECT status FROM assets WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if status != Some(AssetStatus::Indexed) {
            return Ok(false);
        }
        upsert_thumbnail(&tx, id, bytes, now_millis())?;
        tx.commit()?;
        Ok(true)
    }

    // ----- Near duplicates -----

    /// INDEXED assets whose dHash is within `max_distance` bits of `id`'s
    pub fn similar_images(&self, id: &str, max_distance: u32) -> Result<Vec<SimilarAsset>> {
        let conn = self.pool.get()?;

        let target: Option<Option<String>> = conn
            .query_row(
                "SELECT json_extract(metadata, '$.extra.phash') FROM assets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let target = match target {
            None => return Err(MediaError::AssetNotFound(id.to_string())),
            Some(hex) => match hex.as_deref().and_then(dhash_from_hex) {
                Some(h) => h,
                None => return Ok(Vec::new()),
            },
        };

        let mut stmt = conn.prepare(
            "SELECT id, path, json_extract(metadata, '$.extra.phash') FROM assets
             WHERE status = 'INDEXED' AND id != ?1
               AND json_extract(metadata, '$.extra.phash') IS NOT NULL",
        )?;
        let candidates = stmt
            .query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut similar: Vec<SimilarAsset> = candidates
            .into_iter()
            .filter_map(|(asset_id, path, hex)| {
                let distance = hamming_distance(target, dhash_from_hex(&hex)?);
                (distance <= max_distance).then_some(SimilarAsset { asset_id, path, distance })
            })
            .collect();
        similar.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.path.cmp(&b.path)));
        Ok(similar)
    }

    // ----- Tasks -----

    pub fn enqueue_task(&self, asset_id: &str, kind: TaskKind) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        tasks::enqueue_task(&conn, asset_id, kind, now_millis())
    }

    pub fn claim_next_task(&self) -> Result<Option<MediaTask>> {
        let conn = self.pool.get()?;
        tasks::claim_next_task(&conn, now_millis())
    }

    pub fn complete_task(&self, task_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        tasks::complete_task(&conn, task_id, now_millis())
    }

    pub fn fail_task(&self, task_id: i64, error: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        tasks::fail_task(&conn, task_id, error, now_millis())
    }

    pub fn retry_task(&self, task_id: i64, error: &str, not_before: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        tasks::retry_task(&conn, task_id, error, not_before)
    }

    pub fn tasks_for_asset(&self, asset_id: &str) -> Result<Vec<MediaTask>> {
        let conn = self.pool.get()?;
        tasks::tasks_for_asset(&conn, asset_id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<MediaTask>> {
        let conn = self.pool.get()?;
        tasks::list_tasks(&conn, status, limit)
    }

    pub fn task_counts(&self) -> Result<Vec<(TaskKind, TaskStatus, i64)>> {
        let conn = self.pool.get()?;
        tasks::task_counts(&conn)
    }

    pub fn count_tasks_with_status(&self, status: TaskStatus) -> Result<i64> {
        let conn = self.pool.get()?;
        tasks::count_tasks_with_status(&conn, status)
    }

    // ----- Startup recovery -----

    /// Rewind PROCESSING tasks and INDEXING assets left by a previous run.
    /// Returns (tasks rewound, assets rewound).
    pub fn recover(&self) -> Result<(usize, usize)> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task_rows = tasks::reset_processing_tasks(&tx)?;
        let asset_rows = tx.execute(
            "UPDATE assets SET status = 'NEW', updated_at = ?1 WHERE status = 'INDEXING'",
            params![now_millis()],
        )?;
        tx.commit()?;
        Ok((task_rows, asset_rows))
    }
}

/// "dir/" with a trailing separator so "/r/a" does not match "/r/ab"
fn dir_prefix(dir: &Path) -> String {
    let mut prefix = path_key(dir);
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    prefix
}

fn get_asset(conn: &Connection, id: &str) -> Result<Option<Asset>> {
    let sql = format!("SELECT {} FROM assets WHERE id = ?1", ASSET_COLUMNS);
    let asset = conn.query_row(&sql, params![id], asset_from_row).optional()?;
    Ok(asset)
}

fn find_identity(conn: &Connection, path: &str, scope: &Scope) -> Result<Option<Asset>> {
    let sql = format!(
        "SELECT {} FROM assets
         WHERE path = ?1 AND scope = ?2 AND IFNULL(project_id, '') = IFNULL(?3, '')",
        ASSET_COLUMNS
    );
    let asset = conn
        .query_row(&sql, params![path, scope.as_str(), scope.project_id()], asset_from_row)
        .optional()?;
    Ok(asset)
}

fn insert_new(conn: &Connection, path: &str, size: i64, mtime: i64, scope: &Scope) -> Result<Asset> {
    let now = now_millis();
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assets (id, path, size, mtime, scope, project_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'NEW', ?7, ?7)",
        params![id, path, size, mtime, scope.as_str(), scope.project_id(), now],
    )?;
    get_asset(conn, &id)?.ok_or(MediaError::AssetNotFound(id))
}

fn upsert_thumbnail(conn: &Connection, id: &str, bytes: &[u8], now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO asset_thumbnails (asset_id, mime, bytes, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(asset_id) DO UPDATE SET mime = excluded.mime, bytes = excluded.bytes,
             updated_at = excluded.updated_at",
        params![id, thumbnail_mime(bytes), bytes, now],
    )?;
    Ok(())
}
