//! Unique identifiers for business objects, sessions and lock keys.
//!
//! Fresh identifiers are UUID v7 (time-ordered, random). The all-zero value
//! is the "empty" sentinel and never names a live object.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, Result};

/// Opaque 128-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(Uuid);

impl UniqueId {
    /// Mint a new identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The empty sentinel.
    pub const fn empty() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the canonical hyphenated form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::validation(format!("invalid unique id {s:?}: {e}")))
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Uuid> for UniqueId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for UniqueId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// Stored as hyphenated text so ad-hoc SQL can compare against literals.
impl ToSql for UniqueId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for UniqueId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Self::empty()),
            ValueRef::Text(bytes) => {
                let s = std::str::from_utf8(bytes).map_err(|e| FromSqlError::Other(Box::new(e)))?;
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
            ValueRef::Blob(bytes) => Uuid::from_slice(bytes)
                .map(Self)
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_sort_after_empty_and_by_mint_time() {
        let first = UniqueId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = UniqueId::new();
        let mut ids = vec![second, UniqueId::empty(), first];
        ids.sort();
        assert_eq!(ids, vec![UniqueId::empty(), first, second]);
        assert_eq!(first.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_null_and_blob_columns() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let missing: UniqueId = conn.query_row("SELECT NULL", [], |r| r.get(0)).unwrap();
        assert!(missing.is_empty());

        let id = UniqueId::new();
        let raw: UniqueId = conn
            .query_row("SELECT ?1", [id.as_uuid().as_bytes().to_vec()], |r| r.get(0))
            .unwrap();
        assert_eq!(raw, id);
        assert!(conn.query_row("SELECT 42", [], |r| r.get::<_, UniqueId>(0)).is_err());
    }

    #[test]
    fn test_empty_sentinel() {
        let empty = UniqueId::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.to_string(), "00000000-0000-0000-0000-000000000000");
        assert_eq!(UniqueId::default(), empty);
    }

    #[test]
    fn test_parse() {
        let id = UniqueId::new();
        assert_eq!(id.to_string().parse::<UniqueId>().unwrap(), id);
        assert!(UniqueId::parse("not-a-uid").is_err());
    }

    #[test]
    fn test_sql_roundtrip_through_text_column() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (uid TEXT)").unwrap();
        let id = UniqueId::new();
        conn.execute("INSERT INTO t (uid) VALUES (?1)", [&id]).unwrap();
        let back: UniqueId = conn.query_row("SELECT uid FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(back, id);
        let text: String = conn.query_row("SELECT uid FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(text, id.to_string());
    }
}
