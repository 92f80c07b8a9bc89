//! Transaction registry: native transactions addressed by one-byte handles.
//!
//! Each open transaction owns a pooled connection. Handles run 1..=255 and
//! wrap back to 1; 0 means "no transaction" and routes statements to an
//! autocommit connection. The table mutex is held for map updates only,
//! never while a statement runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::storage::pool::{ConnectionPool, PooledConnection};

/// Most transactions one registry keeps open at once.
pub const MAX_OPEN_TRANSACTIONS: usize = u8::MAX as usize;

/// Handle of an open transaction. `TxHandle::NONE` is autocommit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHandle(u8);

impl TxHandle {
    pub const NONE: TxHandle = TxHandle(0);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// How `BEGIN` acquires the database lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Locks are taken on first read/write.
    #[default]
    Deferred,
    /// Takes the write lock up front; waits (busy timeout) on other writers.
    Immediate,
}

impl TransactionMode {
    fn begin_sql(&self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
        }
    }
}

/// Handle allocator: wrapping counter over 1..=255 that skips 0 and live handles.
#[derive(Debug)]
pub struct HandleTable<T> {
    next: u8,
    entries: HashMap<u8, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    /// Store `value` under the next free handle.
    pub fn insert(&mut self, value: T) -> Result<TxHandle> {
        if self.entries.len() >= MAX_OPEN_TRANSACTIONS {
            return Err(EngineError::TransactionLimit(self.entries.len()));
        }
        loop {
            let candidate = self.next;
            self.next = if self.next == u8::MAX { 1 } else { self.next + 1 };
            if !self.entries.contains_key(&candidate) {
                self.entries.insert(candidate, value);
                return Ok(TxHandle(candidate));
            }
        }
    }

    pub fn get(&self, handle: TxHandle) -> Option<&T> {
        self.entries.get(&handle.0)
    }

    pub fn remove(&mut self, handle: TxHandle) -> Option<T> {
        self.entries.remove(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Connection bound to one open transaction.
pub type SharedConnection = Arc<Mutex<PooledConnection>>;

pub struct TransactionRegistry {
    pool: ConnectionPool,
    table: Mutex<HandleTable<SharedConnection>>,
}

impl TransactionRegistry {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            table: Mutex::new(HandleTable::new()),
        }
    }

    /// Open a deferred transaction.
    pub fn begin(&self) -> Result<TxHandle> {
        self.begin_with(TransactionMode::Deferred)
    }

    pub fn begin_with(&self, mode: TransactionMode) -> Result<TxHandle> {
        let open = self.table.lock().len();
        if open >= MAX_OPEN_TRANSACTIONS {
            return Err(EngineError::TransactionLimit(open));
        }

        let conn = self.pool.acquire()?;
        conn.execute_batch(mode.begin_sql())?;
        let handle = self.table.lock().insert(Arc::new(Mutex::new(conn)));
        // On a lost race for the last slot the connection is dropped here and
        // the pool rolls it back.
        let handle = handle?;
        debug!(%handle, ?mode, "transaction begun");
        Ok(handle)
    }

    pub fn commit(&self, handle: TxHandle) -> Result<()> {
        let conn = self.take(handle)?;
        let guard = conn.lock();
        if let Err(e) = guard.execute_batch("COMMIT") {
            warn!(%handle, error = %e, "commit failed, rolling back");
            if !guard.is_autocommit() {
                let _ = guard.execute_batch("ROLLBACK");
            }
            return Err(e.into());
        }
        debug!(%handle, "transaction committed");
        Ok(())
    }

    pub fn rollback(&self, handle: TxHandle) -> Result<()> {
        let conn = self.take(handle)?;
        let guard = conn.lock();
        if !guard.is_autocommit() {
            guard.execute_batch("ROLLBACK")?;
        }
        debug!(%handle, "transaction rolled back");
        Ok(())
    }

    /// Connection of an open transaction.
    pub fn connection(&self, handle: TxHandle) -> Result<SharedConnection> {
        if handle.is_none() {
            return Err(EngineError::InvalidHandle(0));
        }
        self.table
            .lock()
            .get(handle)
            .cloned()
            .ok_or(EngineError::InvalidHandle(handle.0))
    }

    pub fn is_open(&self, handle: TxHandle) -> bool {
        !handle.is_none() && self.table.lock().get(handle).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.table.lock().len()
    }

    fn take(&self, handle: TxHandle) -> Result<SharedConnection> {
        if handle.is_none() {
            return Err(EngineError::InvalidHandle(0));
        }
        self.table
            .lock()
            .remove(handle)
            .ok_or(EngineError::InvalidHandle(handle.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::collections::HashSet;

    fn registry(dir: &tempfile::TempDir) -> TransactionRegistry {
        registry_with(dir, &EngineConfig::default())
    }

    fn registry_with(dir: &tempfile::TempDir, config: &EngineConfig) -> TransactionRegistry {
        let pool = ConnectionPool::new(dir.path().join("tx.db"), config);
        pool.acquire()
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        TransactionRegistry::new(pool)
    }

    #[test]
    fn test_handles_unique_nonzero_until_limit() {
        let mut table = HandleTable::new();
        let mut seen = HashSet::new();
        for i in 0..300 {
            match table.insert(i) {
                Ok(h) => {
                    assert_ne!(h.raw(), 0);
                    assert!(seen.insert(h), "duplicate handle {h}");
                }
                Err(e) => {
                    assert!(i >= 255, "failed early at {i}");
                    assert!(matches!(e, EngineError::TransactionLimit(255)));
                }
            }
        }
        assert_eq!(seen.len(), 255);
    }

    #[test]
    fn test_counter_wraps_skipping_zero_and_live_handles() {
        let mut table = HandleTable::new();
        let handles: Vec<TxHandle> = (0..255).map(|i| table.insert(i).unwrap()).collect();
        assert_eq!(handles.first().unwrap().raw(), 1);
        assert_eq!(handles.last().unwrap().raw(), 255);

        // Only freed handles come back, in wrap order.
        table.remove(TxHandle::from_raw(7)).unwrap();
        table.remove(TxHandle::from_raw(3)).unwrap();
        assert_eq!(table.insert(1000).unwrap().raw(), 3);
        assert_eq!(table.insert(1001).unwrap().raw(), 7);
        assert!(table.insert(1002).is_err());
    }

    #[test]
    fn test_freed_handle_reused_after_wrap() {
        let mut table = HandleTable::new();
        let first = table.insert(()).unwrap();
        table.remove(first).unwrap();
        for _ in 0..254 {
            let h = table.insert(()).unwrap();
            table.remove(h).unwrap();
        }
        // 255 allocations so far; the counter is back at 1.
        assert_eq!(table.insert(()).unwrap(), first);
    }

    #[test]
    fn test_commit_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        let h = reg.begin().unwrap();
        reg.connection(h).unwrap().lock().execute("INSERT INTO t VALUES (1)", []).unwrap();
        reg.commit(h).unwrap();

        let h = reg.begin().unwrap();
        reg.connection(h).unwrap().lock().execute("INSERT INTO t VALUES (2)", []).unwrap();
        reg.rollback(h).unwrap();

        let conn = reg.pool.acquire().unwrap();
        let total: i64 = conn.query_row("SELECT SUM(x) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(total, 1);
        assert_eq!(reg.open_count(), 0);
    }

    #[test]
    fn test_invalid_handles() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);

        assert!(matches!(reg.commit(TxHandle::NONE), Err(EngineError::InvalidHandle(0))));
        assert!(matches!(reg.rollback(TxHandle::NONE), Err(EngineError::InvalidHandle(0))));
        assert!(matches!(
            reg.commit(TxHandle::from_raw(42)),
            Err(EngineError::InvalidHandle(42))
        ));

        let h = reg.begin().unwrap();
        reg.commit(h).unwrap();
        assert!(matches!(reg.commit(h), Err(EngineError::InvalidHandle(_))));
        assert!(matches!(reg.rollback(h), Err(EngineError::InvalidHandle(_))));
        assert!(reg.connection(h).is_err());
    }

    #[test]
    fn test_registry_limit_with_real_connections() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let mut handles = Vec::new();
        for _ in 0..MAX_OPEN_TRANSACTIONS {
            handles.push(reg.begin().unwrap());
        }
        assert!(matches!(reg.begin(), Err(EngineError::TransactionLimit(255))));

        reg.rollback(handles[10]).unwrap();
        let again = reg.begin().unwrap();
        assert_eq!(again, handles[10]);

        for h in handles {
            reg.rollback(h).unwrap();
        }
        assert_eq!(reg.open_count(), 0);
    }

    #[test]
    fn test_transactions_are_isolated_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let writer = reg.begin().unwrap();
        reg.connection(writer)
            .unwrap()
            .lock()
            .execute("INSERT INTO t VALUES (5)", [])
            .unwrap();

        let reader = reg.pool.acquire().unwrap();
        let visible: i64 = reader.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(visible, 0);

        reg.commit(writer).unwrap();
        let visible: i64 = reader.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(visible, 1);
    }

    fn insert(reg: &TransactionRegistry, handle: TxHandle, x: i64) -> Result<usize> {
        let conn = reg.connection(handle)?;
        let guard = conn.lock();
        Ok(guard.execute("INSERT INTO t VALUES (?1)", [x])?)
    }

    #[test]
    fn test_second_deferred_writer_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            busy_timeout_ms: 200,
            ..EngineConfig::default()
        };
        let reg = registry_with(&dir, &config);
        let first = reg.begin().unwrap();
        let second = reg.begin().unwrap();
        insert(&reg, first, 1).unwrap();
        assert!(matches!(insert(&reg, second, 2), Err(EngineError::Busy(_))));

        reg.commit(first).unwrap();
        reg.rollback(second).unwrap();
        let again = reg.begin().unwrap();
        insert(&reg, again, 2).unwrap();
        reg.commit(again).unwrap();
    }

    #[test]
    fn test_immediate_writers_take_turns() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir);
        let first = reg.begin_with(TransactionMode::Immediate).unwrap();

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let second = reg.begin_with(TransactionMode::Immediate).unwrap();
                insert(&reg, second, 2).unwrap();
                reg.commit(second).unwrap();
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            insert(&reg, first, 1).unwrap();
            reg.commit(first).unwrap();
            waiter.join().unwrap();
        });

        let conn = reg.pool.acquire().unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 2);
    }
}
