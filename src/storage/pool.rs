//! Connection pool over one SQLite database file.
//!
//! Connections are opened on demand; released connections are reset and kept
//! for reuse up to `max_idle_connections`.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};

struct PoolInner {
    path: PathBuf,
    busy_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
}

/// Cheap to clone; clones share the idle list.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(path: impl AsRef<Path>, config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                path: path.as_ref().to_path_buf(),
                busy_timeout: config.busy_timeout(),
                max_idle: config.max_idle_connections,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Take an idle connection or open a new one.
    pub fn acquire(&self) -> Result<PooledConnection> {
        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.open_connection()?,
        };
        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            conn: Some(conn),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn open_connection(&self) -> Result<Connection> {
        let path = &self.inner.path;
        let conn = Connection::open(path).map_err(|e| {
            EngineError::Connection(format!("cannot open {}: {e}", path.display()))
        })?;
        conn.busy_timeout(self.inner.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")?;
        debug!(path = %path.display(), "opened connection");
        Ok(conn)
    }
}

/// A connection on loan from the pool. Returned on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.pool.idle.lock().len() >= self.pool.max_idle {
            return;
        }
        match reset_connection(&conn) {
            Ok(()) => {
                let mut idle = self.pool.idle.lock();
                if idle.len() < self.pool.max_idle {
                    idle.push(conn);
                }
            }
            Err(e) => warn!(error = %e, "discarding connection that failed to reset"),
        }
    }
}

/// Roll back anything left open and drop per-connection temp tables.
fn reset_connection(conn: &Connection) -> Result<()> {
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    let temp_tables: Vec<String> = conn
        .prepare("SELECT name FROM temp.sqlite_master WHERE type = 'table'")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for name in temp_tables {
        conn.execute_batch(&format!("DROP TABLE temp.\"{}\"", name.replace('"', "\"\"")))?;
    }
    Ok(())
}
