// Media task repository
//
// The partial unique index on (asset_id, kind) keeps at most one PENDING or
// PROCESSING row per pair, so enqueue is INSERT OR IGNORE.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::schema::{task_from_row, MediaTask, TaskKind, TaskStatus, TASK_COLUMNS};
use crate::error::Result;

/// Enqueue a task. Returns None if an active task for (asset, kind) exists.
pub fn enqueue_task(conn: &Connection, asset_id: &str, kind: TaskKind, now: i64) -> Result<Option<i64>> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO media_tasks (asset_id, kind, status, enqueued_at)
         VALUES (?1, ?2, 'PENDING', ?3)",
        params![asset_id, kind, now],
    )?;
    if rows == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

/// Atomically claim the oldest runnable PENDING task
pub fn claim_next_task(conn: &Connection, now: i64) -> Result<Option<MediaTask>> {
    let sql = format!(
        "UPDATE media_tasks
         SET status = 'PROCESSING', started_at = ?1
         WHERE id = (
             SELECT id FROM media_tasks
             WHERE status = 'PENDING' AND not_before <= ?1
             ORDER BY id ASC
             LIMIT 1
         )
         RETURNING {}",
        TASK_COLUMNS
    );
    let task = conn.query_row(&sql, params![now], task_from_row).optional()?;
    Ok(task)
}

/// PROCESSING -> DONE
pub fn complete_task(conn: &Connection, task_id: i64, now: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE media_tasks SET status = 'DONE', finished_at = ?1, last_error = NULL
         WHERE id = ?2 AND status = 'PROCESSING'",
        params![now, task_id],
    )?;
    Ok(rows > 0)
}

/// PROCESSING -> FAILED
pub fn fail_task(conn: &Connection, task_id: i64, error: &str, now: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE media_tasks
         SET status = 'FAILED', attempts = attempts + 1, last_error = ?1, finished_at = ?2
         WHERE id = ?3 AND status = 'PROCESSING'",
        params![error, now, task_id],
    )?;
    Ok(rows > 0)
}

/// PROCESSING -> PENDING, not claimable before `not_before`
pub fn retry_task(conn: &Connection, task_id: i64, error: &str, not_before: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE media_tasks
         SET status = 'PENDING', attempts = attempts + 1, last_error = ?1,
             not_before = ?2, started_at = NULL
         WHERE id = ?3 AND status = 'PROCESSING'",
        params![error, not_before, task_id],
    )?;
    Ok(rows > 0)
}

/// Crash recovery: every PROCESSING task goes back to PENDING
pub fn reset_processing_tasks(conn: &Connection) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE media_tasks SET status = 'PENDING', started_at = NULL, not_before = 0
         WHERE status = 'PROCESSING'",
        [],
    )?;
    Ok(rows)
}

pub fn get_task(conn: &Connection, task_id: i64) -> Result<Option<MediaTask>> {
    let sql = format!("SELECT {} FROM media_tasks WHERE id = ?1", TASK_COLUMNS);
    let task = conn.query_row(&sql, params![task_id], task_from_row).optional()?;
    Ok(task)
}

pub fn tasks_for_asset(conn: &Connection, asset_id: &str) -> Result<Vec<MediaTask>> {
    let sql = format!(
        "SELECT {} FROM media_tasks WHERE asset_id = ?1 ORDER BY id ASC",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params![asset_id], task_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tasks)
}

pub fn list_tasks(conn: &Connection, status: Option<TaskStatus>, limit: i64) -> Result<Vec<MediaTask>> {
    let sql = format!(
        "SELECT {} FROM media_tasks
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY id DESC LIMIT ?2",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params![status, limit], task_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tasks)
}

/// (kind, status, count) for every populated pair
pub fn task_counts(conn: &Connection) -> Result<Vec<(TaskKind, TaskStatus, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT kind, status, COUNT(*) FROM media_tasks GROUP BY kind, status ORDER BY kind, status",
    )?;
    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

pub fn count_tasks_with_status(conn: &Connection, status: TaskStatus) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM media_tasks WHERE status = ?1",
        params![status],
        |row| row.get(0),
    )?;
    Ok(n)
}
