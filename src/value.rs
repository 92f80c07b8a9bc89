//! Typed field values keyed by declared field type.
//!
//! Values are checked against their declared [`FieldType`] once, when they
//! cross into the engine ([`FieldValue::check`]) or come back out of a row
//! ([`FieldValue::decode`]).

use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::reference::{ObjectGroup, TaggedRef};
use crate::uid::UniqueId;

/// Text layout used for date columns.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Declared type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Int,
    Decimal,
    Bool,
    Date,
    /// Enumeration member stored by name.
    Enum,
    /// Pointer to another object; the column stores the target uid.
    Pointer { group: ObjectGroup, type_name: String },
    Binary,
    /// Homogeneous list, stored as JSON text.
    Array(Box<FieldType>),
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    String(String),
    Int(i64),
    Decimal(Decimal),
    Bool(bool),
    Date(NaiveDateTime),
    Enum(String),
    Pointer(TaggedRef),
    Binary(Vec<u8>),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check the value against a declared type. `Null` fits every type.
    pub fn check(&self, ty: &FieldType) -> Result<()> {
        let ok = match (self, ty) {
            (Self::Null, _) => true,
            (Self::String(_), FieldType::String)
            | (Self::Int(_), FieldType::Int)
            | (Self::Decimal(_), FieldType::Decimal)
            | (Self::Bool(_), FieldType::Bool)
            | (Self::Date(_), FieldType::Date)
            | (Self::Enum(_), FieldType::Enum)
            | (Self::Binary(_), FieldType::Binary) => true,
            (Self::Pointer(r), FieldType::Pointer { group, type_name }) => {
                r.is_empty() || (r.group == *group && r.type_name == *type_name)
            }
            (Self::Array(items), FieldType::Array(inner)) => {
                for item in items {
                    item.check(inner)?;
                }
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "value {self:?} does not fit declared type {ty:?}"
            )))
        }
    }

    /// Decode a column value according to its declared type.
    pub fn decode(ty: &FieldType, raw: ValueRef<'_>) -> Result<Self> {
        if let ValueRef::Null = raw {
            return Ok(Self::Null);
        }
        let mismatch = || {
            EngineError::validation(format!("column value {raw:?} cannot be read as {ty:?}"))
        };
        let value = match ty {
            FieldType::String => Self::String(raw.as_str().map_err(|_| mismatch())?.to_string()),
            FieldType::Enum => Self::Enum(raw.as_str().map_err(|_| mismatch())?.to_string()),
            FieldType::Int => Self::Int(raw.as_i64().map_err(|_| mismatch())?),
            FieldType::Bool => Self::Bool(raw.as_i64().map_err(|_| mismatch())? != 0),
            FieldType::Decimal => match raw {
                ValueRef::Integer(i) => Self::Decimal(Decimal::from(i)),
                ValueRef::Real(f) => {
                    Self::Decimal(Decimal::try_from(f).map_err(|_| mismatch())?)
                }
                ValueRef::Text(_) => Self::Decimal(
                    Decimal::from_str(raw.as_str().map_err(|_| mismatch())?)
                        .map_err(|_| mismatch())?,
                ),
                _ => return Err(mismatch()),
            },
            FieldType::Date => Self::Date(parse_datetime(
                raw.as_str().map_err(|_| mismatch())?,
            )?),
            FieldType::Pointer { group, type_name } => {
                let uid = UniqueId::parse(raw.as_str().map_err(|_| mismatch())?)?;
                Self::Pointer(TaggedRef::new(*group, type_name.clone(), uid))
            }
            FieldType::Binary => Self::Binary(raw.as_blob().map_err(|_| mismatch())?.to_vec()),
            FieldType::Array(_) => {
                let items: Vec<FieldValue> =
                    serde_json::from_str(raw.as_str().map_err(|_| mismatch())?)?;
                Self::Array(items)
            }
        };
        value.check(ty)?;
        Ok(value)
    }

    /// Owned SQLite value, as bound to statements.
    pub fn to_sql_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::String(s) | Self::Enum(s) => Value::Text(s.clone()),
            Self::Int(i) => Value::Integer(*i),
            Self::Decimal(d) => Value::Text(d.normalize().to_string()),
            Self::Bool(b) => Value::Integer(i64::from(*b)),
            Self::Date(d) => Value::Text(format_datetime(d)),
            Self::Pointer(r) => Value::Text(r.uid.to_string()),
            Self::Binary(b) => Value::Blob(b.clone()),
            // Serializing plain data into a String cannot fail.
            Self::Array(items) => {
                Value::Text(serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()))
            }
        }
    }

    /// SQL literal text, used where values are inlined rather than bound.
    pub fn to_literal(&self) -> String {
        match self.to_sql_value() {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
                format!("X'{hex}'")
            }
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.to_sql_value()))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<NaiveDateTime> for FieldValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Date(value)
    }
}

impl From<TaggedRef> for FieldValue {
    fn from(value: TaggedRef) -> Self {
        Self::Pointer(value)
    }
}

impl From<UniqueId> for FieldValue {
    /// A bare uid binds as its text form.
    fn from(value: UniqueId) -> Self {
        Self::String(value.to_string())
    }
}

pub fn format_datetime(value: &NaiveDateTime) -> String {
    value.format(DATE_FORMAT).to_string()
}

pub fn parse_datetime(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| EngineError::validation(format!("invalid date {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_check_matches_declared_type() {
        assert!(FieldValue::Int(5).check(&FieldType::Int).is_ok());
        assert!(FieldValue::Null.check(&FieldType::Decimal).is_ok());
        assert!(FieldValue::Int(5).check(&FieldType::String).is_err());

        let ptr_ty = FieldType::Pointer {
            group: ObjectGroup::Directory,
            type_name: "Item".into(),
        };
        let good = FieldValue::Pointer(TaggedRef::directory("Item", UniqueId::new()));
        let bad = FieldValue::Pointer(TaggedRef::document("Invoice", UniqueId::new()));
        assert!(good.check(&ptr_ty).is_ok());
        assert!(bad.check(&ptr_ty).is_err());

        let arr_ty = FieldType::Array(Box::new(FieldType::Int));
        assert!(FieldValue::Array(vec![FieldValue::Int(1)]).check(&arr_ty).is_ok());
        assert!(FieldValue::Array(vec![FieldValue::Bool(true)]).check(&arr_ty).is_err());
    }

    #[test]
    fn test_decode_through_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (d TEXT, amount TEXT, flag INTEGER, tags TEXT)")
            .unwrap();
        let amount = Decimal::new(12345, 2);
        let tags = FieldValue::Array(vec![FieldValue::from("a"), FieldValue::from("b")]);
        conn.execute(
            "INSERT INTO t VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                FieldValue::Date(date(2024, 3, 1)),
                FieldValue::Decimal(amount),
                FieldValue::Bool(true),
                tags.clone(),
            ],
        )
        .unwrap();

        let (d, a, f, t) = conn
            .query_row("SELECT d, amount, flag, tags FROM t", [], |row| {
                Ok((
                    FieldValue::decode(&FieldType::Date, row.get_ref(0)?).unwrap(),
                    FieldValue::decode(&FieldType::Decimal, row.get_ref(1)?).unwrap(),
                    FieldValue::decode(&FieldType::Bool, row.get_ref(2)?).unwrap(),
                    FieldValue::decode(
                        &FieldType::Array(Box::new(FieldType::String)),
                        row.get_ref(3)?,
                    )
                    .unwrap(),
                ))
            })
            .unwrap();
        assert_eq!(d, FieldValue::Date(date(2024, 3, 1)));
        assert_eq!(a, FieldValue::Decimal(amount));
        assert_eq!(f, FieldValue::Bool(true));
        assert_eq!(t, tags);
    }

    #[test]
    fn test_decode_type_mismatch() {
        let err = FieldValue::decode(&FieldType::Int, ValueRef::Text(b"abc")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(FieldValue::from("O'Hara").to_literal(), "'O''Hara'");
        assert_eq!(FieldValue::Int(7).to_literal(), "7");
        assert_eq!(FieldValue::Null.to_literal(), "NULL");
        assert_eq!(FieldValue::Binary(vec![0xAB, 0x01]).to_literal(), "X'AB01'");
    }
}
