//! Database files, connection routing and result rows.
//!
//! A database is one SQLite file `<data_dir>/<name>.db`. Every statement runs
//! either on the connection of an open transaction handle or, with
//! [`TxHandle::NONE`], on an autocommit connection from the pool.

pub mod pool;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::{FromSql, ToSql, Value, ValueRef};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::query::CompiledQuery;
use crate::transactions::{TransactionMode, TransactionRegistry, TxHandle};
use crate::value::{FieldType, FieldValue};

use self::pool::ConnectionPool;

/// Named statement parameters, as rusqlite takes them.
pub type NamedParams<'a> = [(&'a str, &'a dyn ToSql)];

const MAX_NAME_LEN: usize = 63;

/// One result row with its column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.index_of(column).map(|i| &self.values[i])
    }

    /// Read a column through rusqlite's conversions.
    pub fn get<T: FromSql>(&self, column: &str) -> Result<T> {
        let value = self
            .value(column)
            .ok_or_else(|| EngineError::NotFound(format!("column {column}")))?;
        T::column_result(ValueRef::from(value)).map_err(|e| {
            EngineError::validation(format!("column {column}: {e}"))
        })
    }

    /// Read a column as a value of its declared type.
    pub fn field(&self, column: &str, ty: &FieldType) -> Result<FieldValue> {
        let value = self
            .value(column)
            .ok_or_else(|| EngineError::NotFound(format!("column {column}")))?;
        FieldValue::decode(ty, ValueRef::from(value))
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

pub(crate) fn collect_rows(
    conn: &Connection,
    sql: &str,
    params: &NamedParams<'_>,
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
        }
        out.push(Row {
            columns: Arc::clone(&columns),
            values,
        });
    }
    Ok(out)
}

/// An open database: connection pool plus transaction registry.
pub struct Database {
    name: String,
    pool: ConnectionPool,
    transactions: TransactionRegistry,
    config: EngineConfig,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("path", &self.path())
            .field("open_transactions", &self.transactions.open_count())
            .finish()
    }
}

impl Database {
    /// Reject names that are not `[A-Za-z][A-Za-z0-9_]*` of at most 63 chars.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(EngineError::validation("database name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::validation(format!(
                "database name {name:?} is longer than {MAX_NAME_LEN} characters"
            )));
        }
        let mut chars = name.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(EngineError::validation(format!(
                "database name {name:?} must start with a letter"
            )));
        }
        if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
            return Err(EngineError::validation(format!(
                "database name {name:?} contains invalid character {bad:?}"
            )));
        }
        Ok(())
    }

    pub fn path_for(data_dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(data_dir.as_ref().join(format!("{name}.db")))
    }

    pub fn exists(data_dir: impl AsRef<Path>, name: &str) -> Result<bool> {
        Ok(Self::path_for(data_dir, name)?.is_file())
    }

    /// Create a new database with the system schema.
    pub fn create(data_dir: impl AsRef<Path>, name: &str, config: EngineConfig) -> Result<Self> {
        let path = Self::path_for(&data_dir, name)?;
        if path.exists() {
            return Err(EngineError::validation(format!(
                "database {name:?} already exists"
            )));
        }
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db = Self::attach(name, &path, config)?;
        info!(database = name, path = %path.display(), "database created");
        Ok(db)
    }

    /// Open an existing database, adding any missing system tables.
    pub fn open(data_dir: impl AsRef<Path>, name: &str, config: EngineConfig) -> Result<Self> {
        let path = Self::path_for(&data_dir, name)?;
        if !path.is_file() {
            return Err(EngineError::NotFound(format!("database {name:?}")));
        }
        let db = Self::attach(name, &path, config)?;
        info!(database = name, "database opened");
        Ok(db)
    }

    fn attach(name: &str, path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(path, &config);
        {
            let conn = pool.acquire()?;
            schema::initialize(&conn)?;
        }
        Ok(Self {
            name: name.to_string(),
            transactions: TransactionRegistry::new(pool.clone()),
            pool,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn transactions(&self) -> &TransactionRegistry {
        &self.transactions
    }

    pub fn begin(&self) -> Result<TxHandle> {
        self.transactions.begin()
    }

    pub fn begin_with(&self, mode: TransactionMode) -> Result<TxHandle> {
        self.transactions.begin_with(mode)
    }

    pub fn commit(&self, handle: TxHandle) -> Result<()> {
        self.transactions.commit(handle)
    }

    pub fn rollback(&self, handle: TxHandle) -> Result<()> {
        self.transactions.rollback(handle)
    }

    /// Run `f` on the connection `handle` routes to.
    pub fn with_connection<T>(
        &self,
        handle: TxHandle,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        if handle.is_none() {
            let conn = self.pool.acquire()?;
            f(&*conn)
        } else {
            let shared = self.transactions.connection(handle)?;
            let guard = shared.lock();
            f(&**guard)
        }
    }

    /// Run `f` inside its own immediate transaction, committing on success.
    pub(crate) fn with_write_lock<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.pool.acquire()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&*conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if !conn.is_autocommit() {
                    conn.execute_batch("ROLLBACK")?;
                }
                Err(e)
            }
        }
    }

    /// Execute one statement; returns the number of changed rows.
    pub fn execute(&self, handle: TxHandle, sql: &str, params: &NamedParams<'_>) -> Result<usize> {
        debug!(%handle, sql, "execute");
        self.with_connection(handle, |conn| Ok(conn.execute(sql, params)?))
    }

    /// Execute a compiled statement that returns no rows (e.g. temp-table materialization).
    pub fn execute_compiled(&self, handle: TxHandle, query: &CompiledQuery) -> Result<usize> {
        self.execute(handle, &query.sql, &query.params())
    }

    pub fn query(&self, handle: TxHandle, query: &CompiledQuery) -> Result<Vec<Row>> {
        self.query_sql(handle, &query.sql, &query.params())
    }

    pub fn query_sql(&self, handle: TxHandle, sql: &str, params: &NamedParams<'_>) -> Result<Vec<Row>> {
        debug!(%handle, sql, "query");
        self.with_connection(handle, |conn| collect_rows(conn, sql, params))
    }
}
