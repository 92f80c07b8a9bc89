//! Tagged references: `(group, type, uid)` addresses for any business object.
//!
//! Text form: `{group}/{type}/{uid}`, e.g. `document/Invoice/0195...`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::uid::UniqueId;

/// Storage group of a business object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectGroup {
    /// Master data.
    Directory,
    /// Transactional, postable entity.
    Document,
}

impl ObjectGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "directory" => Ok(Self::Directory),
            "document" => Ok(Self::Document),
            _ => Err(EngineError::validation(format!("invalid object group: {s}"))),
        }
    }
}

impl ToSql for ObjectGroup {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ObjectGroup {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::parse(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl fmt::Display for ObjectGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polymorphic address of a business object.
///
/// Two references are equal when their uids are equal; group and type are
/// descriptive only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedRef {
    pub group: ObjectGroup,
    pub type_name: String,
    pub uid: UniqueId,
}

impl TaggedRef {
    pub fn new(group: ObjectGroup, type_name: impl Into<String>, uid: UniqueId) -> Self {
        Self {
            group,
            type_name: type_name.into(),
            uid,
        }
    }

    pub fn directory(type_name: impl Into<String>, uid: UniqueId) -> Self {
        Self::new(ObjectGroup::Directory, type_name, uid)
    }

    pub fn document(type_name: impl Into<String>, uid: UniqueId) -> Self {
        Self::new(ObjectGroup::Document, type_name, uid)
    }

    /// A reference that points nowhere.
    pub fn is_empty(&self) -> bool {
        self.uid.is_empty()
    }

    /// Parse the `{group}/{type}/{uid}` text form.
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.splitn(3, '/').collect();
        if parts.len() < 3 {
            return Err(EngineError::validation(format!(
                "reference too short: {text}"
            )));
        }
        let group = ObjectGroup::parse(parts[0])?;
        if parts[1].is_empty() {
            return Err(EngineError::validation(format!(
                "reference has no type: {text}"
            )));
        }
        let uid = UniqueId::parse(parts[2])?;
        Ok(Self::new(group, parts[1], uid))
    }
}

impl PartialEq for TaggedRef {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for TaggedRef {}

impl Hash for TaggedRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for TaggedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.type_name, self.uid)
    }
}

impl FromStr for TaggedRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
