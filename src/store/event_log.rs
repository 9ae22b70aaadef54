// Event log repository
//
// Append-only history of published events, read back by the activity feed.
// Retention trims by age and by row count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::{params, Connection};

use crate::constants::{EVENT_LOG_PAGE_MAX, EVENT_LOG_RETENTION_EVERY};
use crate::db::schema::{event_from_row, now_millis, EventRecord};
use crate::db::DbPool;
use crate::error::Result;
use crate::events::{Event, EventSink};

const MILLIS_PER_DAY: i64 = 86_400_000;

pub fn append(
    conn: &Connection,
    topic: &str,
    event_type: &str,
    subject_id: Option<&str>,
    payload: &str,
    now: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO event_log (topic, event_type, subject_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![topic, event_type, subject_id, payload, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Events with id > `after_id`, oldest first
pub fn events_since(conn: &Connection, after_id: i64, limit: i64) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, topic, event_type, subject_id, payload, created_at
         FROM event_log WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
    )?;
    let events = stmt
        .query_map(params![after_id, limit.clamp(1, EVENT_LOG_PAGE_MAX)], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Most recent events for one subject, newest first
pub fn events_for_subject(conn: &Connection, subject_id: &str, limit: i64) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, topic, event_type, subject_id, payload, created_at
         FROM event_log WHERE subject_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let events = stmt
        .query_map(params![subject_id, limit.clamp(1, EVENT_LOG_PAGE_MAX)], event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

/// Drop rows older than `min_created_at`, then everything beyond the newest
/// `max_rows`. Returns rows deleted.
pub fn truncate(conn: &Connection, max_rows: i64, min_created_at: i64) -> Result<usize> {
    let by_age = conn.execute(
        "DELETE FROM event_log WHERE created_at < ?1",
        params![min_created_at],
    )?;
    let by_count = conn.execute(
        "DELETE FROM event_log WHERE id <= (
             SELECT id FROM event_log ORDER BY id DESC LIMIT 1 OFFSET ?1
         )",
        params![max_rows.max(0)],
    )?;
    Ok(by_age + by_count)
}

pub fn count(conn: &Connection) -> Result<i64> {
    let n = conn.query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?;
    Ok(n)
}

/// Durable sink for the event hub
pub struct EventLog {
    pool: Arc<DbPool>,
    max_rows: i64,
    max_age_days: i64,
    appended: AtomicU64,
}

impl EventLog {
    pub fn new(pool: Arc<DbPool>, max_rows: i64, max_age_days: i64) -> Self {
        Self {
            pool,
            max_rows,
            max_age_days,
            appended: AtomicU64::new(0),
        }
    }

    pub fn apply_retention(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let cutoff = now_millis() - self.max_age_days.max(0) * MILLIS_PER_DAY;
        let removed = truncate(&conn, self.max_rows, cutoff)?;
        if removed > 0 {
            log::info!("Event log retention removed {} rows", removed);
        }
        Ok(removed)
    }

    pub fn since(&self, after_id: i64, limit: i64) -> Result<Vec<EventRecord>> {
        let conn = self.pool.get()?;
        events_since(&conn, after_id, limit)
    }

    pub fn for_subject(&self, subject_id: &str, limit: i64) -> Result<Vec<EventRecord>> {
        let conn = self.pool.get()?;
        events_for_subject(&conn, subject_id, limit)
    }
}

impl EventSink for EventLog {
    fn record(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        {
            let conn = self.pool.get()?;
            append(
                &conn,
                event.topic().as_str(),
                event.event_type(),
                event.subject_id(),
                &payload,
                now_millis(),
            )?;
        }

        let n = self.appended.fetch_add(1, Ordering::Relaxed) + 1;
        if n % EVENT_LOG_RETENTION_EVERY == 0 {
            self.apply_retention()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_append_and_replay() {
        let conn = setup();
        let a = append(&conn, "asset", "asset.created", Some("a1"), "{\"x\":1}", 10).unwrap();
        let b = append(&conn, "task", "task.done", None, "{}", 11).unwrap();
        assert!(b > a);

        let all = events_since(&conn, 0, 100).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "asset.created");
        assert_eq!(all[0].payload["x"], 1);

        let tail = events_since(&conn, a, 100).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, b);

        assert_eq!(events_for_subject(&conn, "a1", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_truncate_by_count_and_age() {
        let conn = setup();
        for i in 0..10 {
            append(&conn, "asset", "e", None, "{}", i).unwrap();
        }

        // Age: drop created_at < 3
        // Count: keep newest 5
        let removed = truncate(&conn, 5, 3).unwrap();
        assert_eq!(removed, 5);
        assert_eq!(count(&conn).unwrap(), 5);

        let remaining = events_since(&conn, 0, 100).unwrap();
        assert_eq!(remaining.first().unwrap().created_at, 5);
    }

    #[test]
    fn test_truncate_under_limit_keeps_everything() {
        let conn = setup();
        for i in 0..3 {
            append(&conn, "asset", "e", None, "{}", 100 + i).unwrap();
        }
        assert_eq!(truncate(&conn, 10, 0).unwrap(), 0);
        assert_eq!(count(&conn).unwrap(), 3);
    }
}
