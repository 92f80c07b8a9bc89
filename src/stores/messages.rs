//! Message log: user-facing notices and errors, kept per session.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{named_params, Connection};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::errors::{EngineError, Result};
use crate::reference::{ObjectGroup, TaggedRef};
use crate::sessions::SessionContext;
use crate::storage::{Database, NamedParams};
use crate::uid::UniqueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(EngineError::validation(format!("unknown message level: {other:?}"))),
        }
    }
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for MessageLevel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::parse(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub written_at: i64,
    pub user: String,
    pub session_id: UniqueId,
    pub level: MessageLevel,
    pub text: String,
    pub target: Option<TaggedRef>,
}

fn read_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let group: Option<ObjectGroup> = row.get(6)?;
    let target = match group {
        Some(group) => Some(TaggedRef::new(group, row.get::<_, String>(7)?, row.get(8)?)),
        None => None,
    };
    Ok(Message {
        id: row.get(0)?,
        written_at: row.get(1)?,
        user: row.get(2)?,
        session_id: row.get(3)?,
        level: row.get(4)?,
        text: row.get(5)?,
        target,
    })
}

fn load(conn: &Connection, tail: &str, params: &NamedParams<'_>) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT id, written_at, user_name, session_id, level, text, obj_group, obj_type, obj_uid
         FROM messages {tail}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let messages = stmt
        .query_map(params, read_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

pub struct MessageLog<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> MessageLog<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    pub fn append(
        &self,
        ctx: &SessionContext,
        level: MessageLevel,
        text: &str,
        target: Option<&TaggedRef>,
    ) -> Result<i64> {
        let conn = self.db.pool().acquire()?;
        conn.execute(
            "INSERT INTO messages (written_at, user_name, session_id, level, text, obj_group, obj_type, obj_uid)
             VALUES (:now, :user, :sid, :level, :text, :group, :type, :uid)",
            named_params! {
                ":now": self.clock.now_millis(),
                ":user": ctx.user,
                ":sid": ctx.session_id,
                ":level": level,
                ":text": text,
                ":group": target.map(|t| t.group),
                ":type": target.map(|t| t.type_name.as_str()),
                ":uid": target.map(|t| t.uid),
            },
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Messages of one session, oldest first.
    pub fn for_session(&self, session_id: UniqueId) -> Result<Vec<Message>> {
        let conn = self.db.pool().acquire()?;
        load(
            &conn,
            "WHERE session_id = :sid ORDER BY id ASC",
            named_params! { ":sid": session_id },
        )
    }

    pub fn for_object(&self, target: &TaggedRef) -> Result<Vec<Message>> {
        let conn = self.db.pool().acquire()?;
        load(
            &conn,
            "WHERE obj_uid = :uid ORDER BY id ASC",
            named_params! { ":uid": target.uid },
        )
    }

    /// The newest `limit` messages, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<Message>> {
        let conn = self.db.pool().acquire()?;
        load(
            &conn,
            "ORDER BY id DESC LIMIT :limit",
            named_params! { ":limit": limit as i64 },
        )
    }

    pub fn clear_session(&self, session_id: UniqueId) -> Result<usize> {
        Ok(self.db.pool().acquire()?.execute(
            "DELETE FROM messages WHERE session_id = :sid",
            named_params! { ":sid": session_id },
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::sessions::ClientKind;
    use std::sync::Arc;

    #[test]
    fn test_append_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(5_000));
        let db = Database::create(dir.path(), "erp", EngineConfig::default()).unwrap();
        let engine = Engine::with_clock(db, clock.clone());
        engine.create_user("alice", "a").unwrap();
        let a = engine.sessions().login("alice", "a", ClientKind::Desktop).unwrap();
        let b = engine.sessions().login("alice", "a", ClientKind::Web).unwrap();
        let log = engine.messages();
        let invoice = TaggedRef::document("Invoice", UniqueId::new());

        log.append(&a, MessageLevel::Info, "posted", Some(&invoice)).unwrap();
        clock.advance(10);
        log.append(&a, MessageLevel::Error, "stock below zero", None).unwrap();
        log.append(&b, MessageLevel::Warning, "slow query", None).unwrap();

        let mine = log.for_session(a.session_id).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].target.as_ref(), Some(&invoice));
        assert_eq!(mine[0].written_at, 5_000);
        assert_eq!(mine[1].level, MessageLevel::Error);
        assert!(mine[1].target.is_none());

        assert_eq!(log.for_object(&invoice).unwrap().len(), 1);
        let recent = log.recent(2).unwrap();
        assert_eq!(recent.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["slow query", "stock below zero"]);

        assert_eq!(log.clear_session(a.session_id).unwrap(), 2);
        assert_eq!(log.recent(10).unwrap().len(), 1);
    }
}
