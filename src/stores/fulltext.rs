//! Full-text index over business objects.
//!
//! One text blob per object. A search matches objects whose text contains
//! every query word, case-insensitively.

use rusqlite::named_params;

use crate::clock::Clock;
use crate::errors::Result;
use crate::query::{Comparator, Predicate, QuerySpec, SortDirection};
use crate::reference::{ObjectGroup, TaggedRef};
use crate::storage::Database;
use crate::transactions::TxHandle;
use crate::uid::UniqueId;

const TABLE: &str = "fulltext_entries";

pub struct FullTextIndex<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> FullTextIndex<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    /// Set the indexed text of `target`, replacing any previous text.
    pub fn replace(&self, handle: TxHandle, target: &TaggedRef, content: &str) -> Result<()> {
        let now = self.clock.now_millis();
        self.db.with_connection(handle, |conn| {
            conn.execute(
                "INSERT INTO fulltext_entries (obj_uid, obj_group, obj_type, content, updated_at)
                 VALUES (:uid, :group, :type, :content, :now)
                 ON CONFLICT(obj_uid) DO UPDATE SET
                     obj_group = excluded.obj_group,
                     obj_type = excluded.obj_type,
                     content = excluded.content,
                     updated_at = excluded.updated_at",
                named_params! {
                    ":uid": target.uid,
                    ":group": target.group,
                    ":type": target.type_name,
                    ":content": content.to_lowercase(),
                    ":now": now,
                },
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, handle: TxHandle, target: &TaggedRef) -> Result<bool> {
        let removed = self.db.execute(
            handle,
            "DELETE FROM fulltext_entries WHERE obj_uid = :uid",
            named_params! { ":uid": target.uid },
        )?;
        Ok(removed > 0)
    }

    /// Objects whose text contains every whitespace-separated word of `text`.
    pub fn search(&self, text: &str) -> Result<Vec<TaggedRef>> {
        let mut spec = QuerySpec::new(TABLE)
            .fields(["obj_uid", "obj_group", "obj_type"])
            .order_by("obj_type", SortDirection::Asc)
            .order_by("obj_uid", SortDirection::Asc);
        for word in text.split_whitespace() {
            let pattern = format!("%{}%", word.to_lowercase());
            spec.push_predicate(Predicate::new("content", Comparator::Like, pattern));
        }
        if spec.predicates.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.db.query(TxHandle::NONE, &spec.compile()?)?;
        rows.iter()
            .map(|row| {
                Ok(TaggedRef::new(
                    row.get::<ObjectGroup>("obj_group")?,
                    row.get::<String>("obj_type")?,
                    row.get::<UniqueId>("obj_uid")?,
                ))
            })
            .collect()
    }
}
