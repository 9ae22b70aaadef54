// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;

use crate::error::{MediaError, Result};

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Assets: one row per tracked file per scope.
    -- Timestamps are unix milliseconds; mtime is unix nanoseconds.
    CREATE TABLE assets (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        size INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        fingerprint TEXT,
        scope TEXT NOT NULL CHECK (scope IN ('global', 'private')),
        project_id TEXT,
        status TEXT NOT NULL DEFAULT 'NEW'
            CHECK (status IN ('NEW', 'INDEXING', 'INDEXED', 'FAILED', 'MISSING')),
        parent_asset_id TEXT REFERENCES assets(id) ON DELETE SET NULL,
        format TEXT,
        metadata TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (scope = 'global' OR project_id IS NOT NULL),
        CHECK (status != 'INDEXED' OR (metadata IS NOT NULL AND format IS NOT NULL AND format != ''))
    );

    -- Identity: (path, scope, project_id). NULL project ids compare equal here.
    CREATE UNIQUE INDEX idx_assets_identity ON assets(path, scope, IFNULL(project_id, ''));
    CREATE INDEX idx_assets_status_created ON assets(status, created_at);
    CREATE INDEX idx_assets_fingerprint ON assets(fingerprint) WHERE fingerprint IS NOT NULL;

    -- Thumbnails live out of row so asset listings stay small
    CREATE TABLE asset_thumbnails (
        asset_id TEXT PRIMARY KEY REFERENCES assets(id) ON DELETE CASCADE,
        mime TEXT NOT NULL,
        bytes BLOB NOT NULL,
        updated_at INTEGER NOT NULL
    );

    -- Media tasks (durable work queue)
    CREATE TABLE media_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asset_id TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
        kind TEXT NOT NULL CHECK (kind IN ('PARSE', 'THUMBNAIL', 'FINGERPRINT')),
        status TEXT NOT NULL DEFAULT 'PENDING'
            CHECK (status IN ('PENDING', 'PROCESSING', 'DONE', 'FAILED')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        not_before INTEGER NOT NULL DEFAULT 0,
        enqueued_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER
    );

    -- At most one non-terminal task per (asset, kind)
    CREATE UNIQUE INDEX idx_media_tasks_active ON media_tasks(asset_id, kind)
        WHERE status IN ('PENDING', 'PROCESSING');
    CREATE INDEX idx_media_tasks_claim ON media_tasks(status, not_before, id);
    CREATE INDEX idx_media_tasks_asset ON media_tasks(asset_id);

    -- Event log (append-only, trimmed by retention)
    CREATE TABLE event_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        event_type TEXT NOT NULL,
        subject_id TEXT,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX idx_event_log_created ON event_log(created_at);
    "#,
    // Migration 2: Activity feed filters by subject
    r#"
    CREATE INDEX idx_event_log_subject ON event_log(subject_id, id);
    CREATE INDEX idx_assets_parent ON assets(parent_asset_id) WHERE parent_asset_id IS NOT NULL;
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

pub fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}

/// Run all pending migrations. Each one commits together with its version bump.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = latest_version();

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        return Err(MediaError::Migration(format!(
            "Database schema version {} is newer than this build supports (max {})",
            current_version, target_version
        )));
    }

    if current_version == target_version {
        return Ok(());
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        let batch = format!(
            "BEGIN IMMEDIATE;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            migration, migration_version
        );
        if let Err(e) = conn.execute_batch(&batch) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(MediaError::Migration(format!(
                "Migration {} failed: {}",
                migration_version, e
            )));
        }

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}
