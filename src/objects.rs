//! Business objects: metadata-described directories and documents.
//!
//! An [`ObjectMeta`] declares the table and typed fields of one object
//! type. [`BusinessObject`] holds a uid plus field values checked against
//! those declarations. [`ObjectStore`] persists objects through the query
//! builder and transaction handles, records a version snapshot per save and
//! routes locking through the lock registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::ToSql;
use tracing::debug;

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::locks::LockOutcome;
use crate::query::compile::check_identifier;
use crate::query::{Comparator, Predicate, QuerySpec, SortDirection, LEVEL_COLUMN, UID_FIELD};
use crate::reference::{ObjectGroup, TaggedRef};
use crate::sessions::SessionContext;
use crate::storage::Row;
use crate::transactions::TxHandle;
use crate::uid::UniqueId;
use crate::value::{FieldType, FieldValue};

pub const CODE_FIELD: &str = "code";
pub const NAME_FIELD: &str = "name";
pub const PARENT_FIELD: &str = "parent";
pub const NUMBER_FIELD: &str = "number";
pub const DATE_FIELD: &str = "date";
pub const POSTED_FIELD: &str = "posted";

/// Storage kind of an object type, with its kind-specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Master data; `hierarchical` adds a `parent` pointer to the same type.
    Directory { hierarchical: bool },
    /// Postable entity with number, date and posted flag.
    Document,
}

impl ObjectKind {
    pub fn group(&self) -> ObjectGroup {
        match self {
            Self::Directory { .. } => ObjectGroup::Directory,
            Self::Document => ObjectGroup::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
}

/// Declared shape of one object type.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub kind: ObjectKind,
    pub type_name: String,
    pub table: String,
    pub fields: Vec<FieldDef>,
}

impl ObjectMeta {
    pub fn directory(type_name: impl Into<String>, table: impl Into<String>, hierarchical: bool) -> Self {
        let type_name = type_name.into();
        let mut meta = Self {
            kind: ObjectKind::Directory { hierarchical },
            type_name: type_name.clone(),
            table: table.into(),
            fields: Vec::new(),
        }
        .field(CODE_FIELD, FieldType::String)
        .field(NAME_FIELD, FieldType::String);
        if hierarchical {
            meta = meta.field(
                PARENT_FIELD,
                FieldType::Pointer {
                    group: ObjectGroup::Directory,
                    type_name,
                },
            );
        }
        meta
    }

    pub fn document(type_name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Document,
            type_name: type_name.into(),
            table: table.into(),
            fields: Vec::new(),
        }
        .field(NUMBER_FIELD, FieldType::String)
        .field(DATE_FIELD, FieldType::Date)
        .field(POSTED_FIELD, FieldType::Bool)
    }

    /// Declare a field. Redeclaring a name replaces its type.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(def) => def.ty = ty,
            None => self.fields.push(FieldDef { name, ty }),
        }
        self
    }

    pub fn group(&self) -> ObjectGroup {
        self.kind.group()
    }

    pub fn is_hierarchical(&self) -> bool {
        matches!(self.kind, ObjectKind::Directory { hierarchical: true })
    }

    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.ty)
    }

    fn validate(&self) -> Result<()> {
        check_identifier(&self.table)?;
        for def in &self.fields {
            check_identifier(&def.name)?;
            if def.name == UID_FIELD {
                return Err(EngineError::validation(format!(
                    "{}: field name {UID_FIELD:?} is reserved",
                    self.type_name
                )));
            }
            if self.is_hierarchical() && def.name.eq_ignore_ascii_case(LEVEL_COLUMN) {
                return Err(EngineError::validation(format!(
                    "{}: hierarchical directories cannot declare {LEVEL_COLUMN:?}",
                    self.type_name
                )));
            }
        }
        Ok(())
    }

    fn create_table_sql(&self) -> String {
        let mut columns = vec![format!("{UID_FIELD} TEXT PRIMARY KEY")];
        for def in &self.fields {
            let sql_type = match def.ty {
                FieldType::Int | FieldType::Bool => "INTEGER",
                FieldType::Binary => "BLOB",
                _ => "TEXT",
            };
            columns.push(format!("{} {sql_type}", def.name));
        }
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.table, columns.join(", "))
    }
}

/// One object instance: identity plus typed field values.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessObject {
    meta: Arc<ObjectMeta>,
    uid: UniqueId,
    values: BTreeMap<String, FieldValue>,
}

impl BusinessObject {
    /// A new object with a fresh uid and every field `Null`.
    pub fn new(meta: &Arc<ObjectMeta>) -> Self {
        Self::with_uid(meta, UniqueId::new())
    }

    fn with_uid(meta: &Arc<ObjectMeta>, uid: UniqueId) -> Self {
        Self {
            meta: Arc::clone(meta),
            uid,
            values: meta
                .fields
                .iter()
                .map(|f| (f.name.clone(), FieldValue::Null))
                .collect(),
        }
    }

    pub fn uid(&self) -> UniqueId {
        self.uid
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn reference(&self) -> TaggedRef {
        TaggedRef::new(self.meta.group(), self.meta.type_name.clone(), self.uid)
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        self.values
            .get(field)
            .ok_or_else(|| EngineError::NotFound(format!("field {}.{field}", self.meta.type_name)))
    }

    /// Set a declared field; the value must fit the declared type.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let ty = self
            .meta
            .field_type(field)
            .ok_or_else(|| EngineError::NotFound(format!("field {}.{field}", self.meta.type_name)))?;
        let value = value.into();
        value.check(ty)?;
        self.values.insert(field.to_string(), value);
        Ok(())
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    /// Text and enum fields joined by spaces, in field-name order.
    pub fn search_text(&self) -> String {
        self.values
            .values()
            .filter_map(|v| match v {
                FieldValue::String(s) | FieldValue::Enum(s) if !s.is_empty() => Some(s.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn from_row(meta: &Arc<ObjectMeta>, row: &Row) -> Result<Self> {
        let mut obj = Self::with_uid(meta, row.get(UID_FIELD)?);
        for def in &meta.fields {
            obj.values.insert(def.name.clone(), row.field(&def.name, &def.ty)?);
        }
        Ok(obj)
    }
}

/// Object persistence on top of one engine.
pub struct ObjectStore<'a> {
    engine: &'a Engine,
}

impl<'a> ObjectStore<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Create the table of `meta` if missing.
    pub fn ensure_table(&self, meta: &ObjectMeta) -> Result<()> {
        meta.validate()?;
        self.engine
            .database()
            .execute(TxHandle::NONE, &meta.create_table_sql(), &[])?;
        Ok(())
    }

    /// Insert a new row and store version 1.
    pub fn insert(&self, handle: TxHandle, ctx: &SessionContext, obj: &BusinessObject) -> Result<i64> {
        if obj.uid.is_empty() {
            return Err(EngineError::validation("cannot insert an object with an empty uid"));
        }
        let meta = &obj.meta;
        let mut names = vec![UID_FIELD.to_string()];
        let mut values = vec![FieldValue::from(obj.uid)];
        for (name, value) in &obj.values {
            names.push(name.clone());
            values.push(value.clone());
        }
        let placeholders: Vec<String> = names.iter().map(|n| format!(":{n}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            meta.table,
            names.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<(&str, &dyn ToSql)> = placeholders
            .iter()
            .zip(&values)
            .map(|(p, v)| (p.as_str(), v as &dyn ToSql))
            .collect();
        self.engine.database().execute(handle, &sql, &params)?;
        debug!(target = %obj.reference(), "object inserted");
        self.snapshot(handle, ctx, obj)
    }

    /// Write every field of an existing row and store the next version.
    pub fn update(&self, handle: TxHandle, ctx: &SessionContext, obj: &BusinessObject) -> Result<i64> {
        let meta = &obj.meta;
        let assignments: Vec<String> = obj.values.keys().map(|n| format!("{n} = :{n}")).collect();
        if assignments.is_empty() {
            return self.snapshot(handle, ctx, obj);
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {UID_FIELD} = :{UID_FIELD}",
            meta.table,
            assignments.join(", ")
        );
        let uid = FieldValue::from(obj.uid);
        let uid_param = format!(":{UID_FIELD}");
        let names: Vec<String> = obj.values.keys().map(|n| format!(":{n}")).collect();
        let mut params: Vec<(&str, &dyn ToSql)> = names
            .iter()
            .zip(obj.values.values())
            .map(|(n, v)| (n.as_str(), v as &dyn ToSql))
            .collect();
        params.push((uid_param.as_str(), &uid as &dyn ToSql));
        let changed = self.engine.database().execute(handle, &sql, &params)?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("{}", obj.reference())));
        }
        debug!(target = %obj.reference(), "object updated");
        self.snapshot(handle, ctx, obj)
    }

    /// Store the next version and refresh the full-text entry.
    fn snapshot(&self, handle: TxHandle, ctx: &SessionContext, obj: &BusinessObject) -> Result<i64> {
        let target = obj.reference();
        let version = self.engine.versions().append(handle, &ctx.user, &target, &obj.values)?;
        self.engine.fulltext().replace(handle, &target, &obj.search_text())?;
        Ok(version)
    }

    pub fn load(&self, handle: TxHandle, meta: &Arc<ObjectMeta>, uid: UniqueId) -> Result<BusinessObject> {
        let query = QuerySpec::new(meta.table.as_str())
            .filter(UID_FIELD, Comparator::Eq, uid)
            .compile()?;
        let rows = self.engine.database().query(handle, &query)?;
        match rows.first() {
            Some(row) => BusinessObject::from_row(meta, row),
            None => Err(EngineError::NotFound(format!("{}/{}/{uid}", meta.group(), meta.type_name))),
        }
    }

    /// Delete the row and its full-text entry. Version history is kept.
    pub fn delete(&self, handle: TxHandle, meta: &ObjectMeta, uid: UniqueId) -> Result<bool> {
        check_identifier(&meta.table)?;
        let removed = self.engine.database().execute(
            handle,
            &format!("DELETE FROM {} WHERE {UID_FIELD} = :uid", meta.table),
            &[(":uid", &uid as &dyn ToSql)],
        )?;
        self.engine
            .fulltext()
            .remove(handle, &TaggedRef::new(meta.group(), meta.type_name.clone(), uid))?;
        Ok(removed > 0)
    }

    /// Direct children of `parent` (the empty uid lists roots), by code.
    pub fn list_children(
        &self,
        handle: TxHandle,
        meta: &Arc<ObjectMeta>,
        parent: UniqueId,
    ) -> Result<Vec<BusinessObject>> {
        self.require_hierarchy(meta)?;
        let mut spec = QuerySpec::new(meta.table.as_str()).order_by(CODE_FIELD, SortDirection::Asc);
        if parent.is_empty() {
            spec = spec
                .filter(PARENT_FIELD, Comparator::Eq, UniqueId::empty())
                .predicate(Predicate::raw_sql(PARENT_FIELD, Comparator::IsNull, "").or());
        } else {
            spec = spec.filter(PARENT_FIELD, Comparator::Eq, parent);
        }
        let rows = self.engine.database().query(handle, &spec.compile()?)?;
        rows.iter().map(|row| BusinessObject::from_row(meta, row)).collect()
    }

    /// Whole hierarchy as `(level, object)`, roots at level 1, shallow levels first.
    pub fn tree(&self, handle: TxHandle, meta: &Arc<ObjectMeta>) -> Result<Vec<(i64, BusinessObject)>> {
        self.require_hierarchy(meta)?;
        let query = QuerySpec::new(meta.table.as_str())
            .hierarchy(PARENT_FIELD)
            .order_by(CODE_FIELD, SortDirection::Asc)
            .compile_hierarchical()?;
        let rows = self.engine.database().query(handle, &query)?;
        rows.iter()
            .map(|row| Ok((row.get::<i64>(LEVEL_COLUMN)?, BusinessObject::from_row(meta, row)?)))
            .collect()
    }

    fn require_hierarchy(&self, meta: &ObjectMeta) -> Result<()> {
        if meta.is_hierarchical() {
            Ok(())
        } else {
            Err(EngineError::validation(format!("{} is not hierarchical", meta.type_name)))
        }
    }

    pub fn lock(&self, ctx: &SessionContext, obj: &BusinessObject) -> Result<LockOutcome> {
        self.engine.locks().try_lock(ctx, &obj.reference())
    }

    pub fn unlock(&self, key: UniqueId) -> Result<bool> {
        self.engine.locks().unlock(key)
    }
}
