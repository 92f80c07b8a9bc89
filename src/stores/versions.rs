//! Object version history: one JSON snapshot per save.
//!
//! Versions start at 1 and grow by one per object. The next number is taken
//! inside the inserting statement, so concurrent saves of one object cannot
//! claim the same version.

use rusqlite::{named_params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::errors::{EngineError, Result};
use crate::reference::TaggedRef;
use crate::storage::Database;
use crate::transactions::TxHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionEntry {
    pub target: TaggedRef,
    pub version: i64,
    pub written_at: i64,
    pub user: String,
    pub payload: serde_json::Value,
}

impl VersionEntry {
    /// Deserialize the snapshot.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

fn read_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<(VersionEntry, String)> {
    Ok((
        VersionEntry {
            target: TaggedRef::new(row.get(1)?, row.get::<_, String>(2)?, row.get(0)?),
            version: row.get(3)?,
            written_at: row.get(4)?,
            user: row.get(5)?,
            payload: serde_json::Value::Null,
        },
        row.get(6)?,
    ))
}

fn with_payload((mut entry, text): (VersionEntry, String)) -> Result<VersionEntry> {
    entry.payload = serde_json::from_str(&text)?;
    Ok(entry)
}

const VERSION_COLUMNS: &str = "obj_uid, obj_group, obj_type, version, written_at, user_name, payload";

pub struct VersionHistory<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> VersionHistory<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    /// Store a snapshot of `target`; returns the new version number.
    pub fn append<T: Serialize + ?Sized>(
        &self,
        handle: TxHandle,
        user: &str,
        target: &TaggedRef,
        snapshot: &T,
    ) -> Result<i64> {
        if target.is_empty() {
            return Err(EngineError::validation("cannot version an empty reference"));
        }
        let payload = serde_json::to_string(snapshot)?;
        let now = self.clock.now_millis();
        let version = self.db.with_connection(handle, |conn| {
            Ok(conn.query_row(
                "INSERT INTO object_versions (obj_uid, version, obj_group, obj_type, written_at, user_name, payload)
                 SELECT :uid, COALESCE(MAX(version), 0) + 1, :group, :type, :now, :user, :payload
                 FROM object_versions WHERE obj_uid = :uid
                 RETURNING version",
                named_params! {
                    ":uid": target.uid,
                    ":group": target.group,
                    ":type": target.type_name,
                    ":now": now,
                    ":user": user,
                    ":payload": payload,
                },
                |row| row.get(0),
            )?)
        })?;
        debug!(%target, version, "version stored");
        Ok(version)
    }

    /// All versions of `target`, oldest first.
    pub fn list(&self, target: &TaggedRef) -> Result<Vec<VersionEntry>> {
        let conn = self.db.pool().acquire()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions WHERE obj_uid = :uid ORDER BY version ASC"
        ))?;
        let rows = stmt
            .query_map(named_params! { ":uid": target.uid }, read_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(with_payload).collect()
    }

    pub fn load(&self, target: &TaggedRef, version: i64) -> Result<VersionEntry> {
        let conn = self.db.pool().acquire()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM object_versions WHERE obj_uid = :uid AND version = :version"
                ),
                named_params! { ":uid": target.uid, ":version": version },
                read_version,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("version {version} of {target}")))?;
        with_payload(row)
    }

    pub fn latest(&self, target: &TaggedRef) -> Result<Option<VersionEntry>> {
        let conn = self.db.pool().acquire()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM object_versions WHERE obj_uid = :uid
                     ORDER BY version DESC LIMIT 1"
                ),
                named_params! { ":uid": target.uid },
                read_version,
            )
            .optional()?;
        row.map(with_payload).transpose()
    }
}
