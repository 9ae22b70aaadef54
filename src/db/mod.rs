// Database module
//
// Every repository goes through DbPool. Connections are opened once, kept in a
// bounded free list and handed out as guards that return themselves on drop.

pub mod migrations;
pub mod schema;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use rusqlite::Connection;

use crate::constants::{CACHE_FOLDER, DB_BUSY_TIMEOUT_MS, DB_FILENAME, DB_FOLDER, LOGS_FOLDER};
use crate::error::{MediaError, Result};

const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a connection with the per-connection pragmas applied
fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Foreign keys must be enabled per connection
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS as u64))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

    Ok(conn)
}

/// Open or create a database at the given path and bring its schema up to date
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = open_connection(db_path)?;

    // WAL is persistent, so setting it once on the first connection is enough
    conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;

    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Get the database path for a data directory
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FOLDER).join(DB_FILENAME)
}

/// Initialize data folder structure
pub fn init_data_folders(data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir.join(DB_FOLDER))?;
    std::fs::create_dir_all(data_dir.join(CACHE_FOLDER))?;
    std::fs::create_dir_all(data_dir.join(LOGS_FOLDER))?;
    Ok(())
}

/// Fixed-size SQLite connection pool.
pub struct DbPool {
    path: PathBuf,
    size: usize,
    free_tx: Sender<Connection>,
    free_rx: Receiver<Connection>,
}

impl DbPool {
    /// Open `size` connections. The first one runs migrations.
    pub fn open(db_path: &Path, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (free_tx, free_rx) = bounded(size);

        let first = open_db(db_path)?;
        send_back(&free_tx, first);
        for _ in 1..size {
            send_back(&free_tx, open_connection(db_path)?);
        }

        log::info!("Opened database {} with {} connections", db_path.display(), size);

        Ok(Self {
            path: db_path.to_path_buf(),
            size,
            free_tx,
            free_rx,
        })
    }

    /// Check out a connection, blocking until one is free.
    pub fn get(&self) -> Result<PooledConn> {
        let conn = self.free_rx.recv_timeout(POOL_CHECKOUT_TIMEOUT).map_err(|_| {
            MediaError::Other(format!(
                "Timed out waiting for a database connection ({} in pool)",
                self.size
            ))
        })?;
        Ok(PooledConn {
            conn: Some(conn),
            home: self.free_tx.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections currently checked in
    pub fn idle(&self) -> usize {
        self.free_rx.len()
    }
}

fn send_back(home: &Sender<Connection>, conn: Connection) {
    // The channel holds exactly `size` slots and we never mint extra connections
    if home.try_send(conn).is_err() {
        log::warn!("Connection pool full on check-in, dropping connection");
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    home: Sender<Connection>,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only None during drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection used after drop"))
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection used after drop"))
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            send_back(&self.home, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pool_hands_out_and_reclaims() {
        let dir = TempDir::new().unwrap();
        let pool = DbPool::open(&get_db_path(dir.path()), 2).unwrap();
        assert_eq!(pool.idle(), 2);

        {
            let a = pool.get().unwrap();
            let _b = pool.get().unwrap();
            assert_eq!(pool.idle(), 0);
            let n: i64 = a.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
            assert_eq!(n, 1);
        }

        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_connections_have_pragmas() {
        let dir = TempDir::new().unwrap();
        let pool = DbPool::open(&get_db_path(dir.path()), 2).unwrap();
        let conn = pool.get().unwrap();
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
