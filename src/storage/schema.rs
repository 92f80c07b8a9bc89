//! System tables shared by every engine instance attached to a database.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use crate::errors::{EngineError, Result};

pub const SCHEMA_VERSION: i64 = 1;

const SYSTEM_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        uid TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        user_name TEXT NOT NULL,
        client_kind TEXT NOT NULL,
        login_at INTEGER NOT NULL,
        heartbeat_at INTEGER NOT NULL,
        is_master INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS locked_objects (
        lock_key TEXT PRIMARY KEY,
        user_name TEXT NOT NULL,
        session_id TEXT NOT NULL,
        locked_at INTEGER NOT NULL,
        obj_group TEXT NOT NULL,
        obj_type TEXT NOT NULL,
        obj_uid TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS register_triggers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        written_at INTEGER NOT NULL,
        period TEXT NOT NULL,
        register_name TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        document TEXT NOT NULL,
        executed INTEGER NOT NULL DEFAULT 0,
        info TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS doc_ignore (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        written_at INTEGER NOT NULL,
        user_name TEXT NOT NULL,
        session_id TEXT NOT NULL,
        document TEXT NOT NULL,
        info TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        written_at INTEGER NOT NULL,
        user_name TEXT NOT NULL,
        session_id TEXT NOT NULL,
        level TEXT NOT NULL,
        text TEXT NOT NULL,
        obj_group TEXT,
        obj_type TEXT,
        obj_uid TEXT
    );

    CREATE TABLE IF NOT EXISTS object_versions (
        obj_uid TEXT NOT NULL,
        version INTEGER NOT NULL,
        obj_group TEXT NOT NULL,
        obj_type TEXT NOT NULL,
        written_at INTEGER NOT NULL,
        user_name TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (obj_uid, version)
    );

    CREATE TABLE IF NOT EXISTS fulltext_entries (
        obj_uid TEXT PRIMARY KEY,
        obj_group TEXT NOT NULL,
        obj_type TEXT NOT NULL,
        content TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_locked_objects_session ON locked_objects(session_id);
    CREATE INDEX IF NOT EXISTS idx_register_triggers_executed ON register_triggers(executed);
    CREATE INDEX IF NOT EXISTS idx_doc_ignore_document ON doc_ignore(document);
    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
";

/// Create missing system tables and stamp the schema version.
///
/// Idempotent and safe to race from several connections; refuses a
/// database stamped with a newer version.
pub fn initialize(conn: &Connection) -> Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute_batch(SYSTEM_SCHEMA)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    let stamped: String = tx.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    let version: i64 = stamped.parse().map_err(|_| {
        EngineError::Connection(format!("corrupt schema version stamp: {stamped:?}"))
    })?;
    if version > SCHEMA_VERSION {
        return Err(EngineError::Connection(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    tx.commit()?;
    Ok(())
}
