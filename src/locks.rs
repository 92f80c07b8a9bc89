//! Locked-object registry: advisory, cooperative pessimistic locks.
//!
//! A row in `locked_objects` is the lock. The unique index on the object uid
//! makes acquisition a single conditional insert, so two sessions racing for
//! one object cannot both win.

use rusqlite::{named_params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::errors::{EngineError, Result};
use crate::reference::TaggedRef;
use crate::sessions::SessionContext;
use crate::storage::{Database, NamedParams};
use crate::uid::UniqueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock under this key.
    Acquired(UniqueId),
    /// Somebody (possibly the caller) already holds it.
    AlreadyLocked,
}

impl LockOutcome {
    /// Key of an acquired lock; the empty uid otherwise.
    pub fn key(&self) -> UniqueId {
        match self {
            Self::Acquired(key) => *key,
            Self::AlreadyLocked => UniqueId::empty(),
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub key: UniqueId,
    pub user: String,
    pub session_id: UniqueId,
    pub locked_at: i64,
    pub target: TaggedRef,
}

const LOCK_COLUMNS: &str = "lock_key, user_name, session_id, locked_at, obj_group, obj_type, obj_uid";

fn read_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockEntry> {
    Ok(LockEntry {
        key: row.get(0)?,
        user: row.get(1)?,
        session_id: row.get(2)?,
        locked_at: row.get(3)?,
        target: TaggedRef::new(row.get(4)?, row.get::<_, String>(5)?, row.get(6)?),
    })
}

fn load_locks(conn: &Connection, filter: &str, params: &NamedParams<'_>) -> Result<Vec<LockEntry>> {
    let sql = format!("SELECT {LOCK_COLUMNS} FROM locked_objects {filter} ORDER BY locked_at ASC, lock_key ASC");
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params, read_lock)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub struct LockRegistry<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> LockRegistry<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    /// Lock `target` for the calling session. The session must still be
    /// registered; an evicted or logged-out session gets `NotFound`.
    pub fn try_lock(&self, ctx: &SessionContext, target: &TaggedRef) -> Result<LockOutcome> {
        if target.is_empty() {
            return Err(EngineError::validation("cannot lock an empty reference"));
        }
        let key = UniqueId::new();
        let conn = self.db.pool().acquire()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO locked_objects
                 (lock_key, user_name, session_id, locked_at, obj_group, obj_type, obj_uid)
             SELECT :key, :user, :sid, :now, :group, :type, :uid
             WHERE EXISTS (SELECT 1 FROM sessions WHERE session_id = :sid)",
            named_params! {
                ":key": key,
                ":user": ctx.user,
                ":sid": ctx.session_id,
                ":now": self.clock.now_millis(),
                ":group": target.group,
                ":type": target.type_name,
                ":uid": target.uid,
            },
        )?;
        if inserted == 1 {
            debug!(%target, user = %ctx.user, %key, "object locked");
            return Ok(LockOutcome::Acquired(key));
        }
        let live: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE session_id = :sid",
                named_params! { ":sid": ctx.session_id },
                |row| row.get(0),
            )
            .optional()?;
        if live.is_none() {
            Err(EngineError::NotFound(format!("session {}", ctx.session_id)))
        } else {
            debug!(%target, user = %ctx.user, "object already locked");
            Ok(LockOutcome::AlreadyLocked)
        }
    }

    /// Release a lock. Returns whether the key was live.
    pub fn unlock(&self, key: UniqueId) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let removed = self.db.pool().acquire()?.execute(
            "DELETE FROM locked_objects WHERE lock_key = :key",
            named_params! { ":key": key },
        )?;
        Ok(removed > 0)
    }

    /// Whether `key` names a live lock. The empty key never does.
    pub fn is_locked(&self, key: UniqueId) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let found: Option<i64> = self
            .db
            .pool()
            .acquire()?
            .query_row(
                "SELECT 1 FROM locked_objects WHERE lock_key = :key",
                named_params! { ":key": key },
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Current holder of `target`, if locked.
    pub fn lock_info(&self, target: &TaggedRef) -> Result<Option<LockEntry>> {
        let conn = self.db.pool().acquire()?;
        Ok(load_locks(&conn, "WHERE obj_uid = :uid", named_params! { ":uid": target.uid })?
            .into_iter()
            .next())
    }

    pub fn locks_for_session(&self, session_id: UniqueId) -> Result<Vec<LockEntry>> {
        let conn = self.db.pool().acquire()?;
        load_locks(&conn, "WHERE session_id = :sid", named_params! { ":sid": session_id })
    }

    pub fn unlock_all_for_session(&self, session_id: UniqueId) -> Result<usize> {
        let removed = self.db.pool().acquire()?.execute(
            "DELETE FROM locked_objects WHERE session_id = :sid",
            named_params! { ":sid": session_id },
        )?;
        if removed > 0 {
            info!(session = %session_id, removed, "released session locks");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<LockEntry>> {
        let conn = self.db.pool().acquire()?;
        load_locks(&conn, "", &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::reference::ObjectGroup;
    use crate::sessions::ClientKind;
    use crate::transactions::TxHandle;
    use std::sync::{Arc, Barrier};

    fn setup() -> (tempfile::TempDir, Engine, SessionContext, SessionContext) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path(), "erp", EngineConfig::default()).unwrap();
        let engine = Engine::with_clock(db, Arc::new(ManualClock::new(1_000)));
        engine.create_user("alice", "a").unwrap();
        engine.create_user("bob", "b").unwrap();
        let alice = engine.sessions().login("alice", "a", ClientKind::Desktop).unwrap();
        let bob = engine.sessions().login("bob", "b", ClientKind::Desktop).unwrap();
        (dir, engine, alice, bob)
    }

    #[test]
    fn test_lock_unlock_cycle() {
        let (_dir, engine, alice, bob) = setup();
        let locks = engine.locks();
        let invoice = TaggedRef::document("Invoice", UniqueId::new());

        let key = locks.try_lock(&alice, &invoice).unwrap().key();
        assert!(!key.is_empty());
        assert!(locks.is_locked(key).unwrap());
        assert_eq!(locks.try_lock(&bob, &invoice).unwrap(), LockOutcome::AlreadyLocked);
        assert_eq!(locks.try_lock(&alice, &invoice).unwrap().key(), UniqueId::empty());

        let info = locks.lock_info(&invoice).unwrap().unwrap();
        assert_eq!(info.user, "alice");
        assert_eq!(info.session_id, alice.session_id);
        assert_eq!(info.target.group, ObjectGroup::Document);
        assert_eq!(info.target.type_name, "Invoice");
        assert_eq!(info.locked_at, 1_000);

        assert!(locks.unlock(key).unwrap());
        assert!(!locks.unlock(key).unwrap());
        assert!(!locks.is_locked(key).unwrap());
        assert!(locks.try_lock(&bob, &invoice).unwrap().is_acquired());
    }

    #[test]
    fn test_empty_key_and_reference() {
        let (_dir, engine, alice, _bob) = setup();
        let locks = engine.locks();
        assert!(!locks.is_locked(UniqueId::empty()).unwrap());
        assert!(!locks.unlock(UniqueId::empty()).unwrap());
        let empty = TaggedRef::directory("Item", UniqueId::empty());
        assert!(matches!(locks.try_lock(&alice, &empty), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_session_scoped_listing_and_release() {
        let (_dir, engine, alice, bob) = setup();
        let locks = engine.locks();
        for _ in 0..3 {
            locks.try_lock(&alice, &TaggedRef::directory("Item", UniqueId::new())).unwrap();
        }
        locks.try_lock(&bob, &TaggedRef::directory("Item", UniqueId::new())).unwrap();

        assert_eq!(locks.locks_for_session(alice.session_id).unwrap().len(), 3);
        assert_eq!(locks.list().unwrap().len(), 4);
        assert_eq!(locks.unlock_all_for_session(alice.session_id).unwrap(), 3);
        assert!(locks.locks_for_session(alice.session_id).unwrap().is_empty());
        assert_eq!(locks.locks_for_session(bob.session_id).unwrap().len(), 1);
    }

    #[test]
    fn test_logout_releases_locks() {
        let (_dir, engine, alice, _bob) = setup();
        let item = TaggedRef::directory("Item", UniqueId::new());
        engine.locks().try_lock(&alice, &item).unwrap();
        engine.sessions().logout(&alice).unwrap();
        assert!(engine.locks().lock_info(&item).unwrap().is_none());
    }

    #[test]
    fn test_evicted_session_cannot_lock() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path(), "erp", EngineConfig::default()).unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = Engine::with_clock(db, clock.clone());
        engine.create_user("alice", "a").unwrap();
        let ghost = engine.sessions().login("alice", "a", ClientKind::Web).unwrap();

        clock.advance(400_000);
        let report = engine.sessions().maintain().unwrap();
        assert_eq!(report.evicted, vec![ghost.session_id]);

        let item = TaggedRef::directory("Item", UniqueId::new());
        assert!(matches!(engine.locks().try_lock(&ghost, &item), Err(EngineError::NotFound(_))));
        assert!(engine.locks().lock_info(&item).unwrap().is_none());

        let alice = engine.sessions().login("alice", "a", ClientKind::Desktop).unwrap();
        assert!(engine.locks().try_lock(&alice, &item).unwrap().is_acquired());
    }

    #[test]
    fn test_maintenance_drops_orphaned_locks() {
        let (_dir, engine, alice, _bob) = setup();
        let item = TaggedRef::directory("Item", UniqueId::new());
        engine.locks().try_lock(&alice, &item).unwrap();
        engine
            .database()
            .execute(
                TxHandle::NONE,
                "DELETE FROM sessions WHERE session_id = :sid",
                named_params! { ":sid": alice.session_id },
            )
            .unwrap();
        assert!(engine.locks().lock_info(&item).unwrap().is_some());

        let report = engine.sessions().maintain().unwrap();
        assert_eq!(report.orphaned_locks, 1);
        assert!(engine.locks().lock_info(&item).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_try_lock_has_one_winner() {
        let (_dir, engine, alice, bob) = setup();
        let target = TaggedRef::document("Order", UniqueId::new());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [alice.clone(), bob.clone()]
            .into_iter()
            .map(|ctx| {
                let engine = engine.clone();
                let target = target.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    (ctx.session_id, engine.locks().try_lock(&ctx, &target).unwrap())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter(|(_, o)| o.is_acquired()).collect();
        assert_eq!(winners.len(), 1);
        let info = engine.locks().lock_info(&target).unwrap().unwrap();
        assert_eq!(info.session_id, winners[0].0);
        assert_eq!(info.key, winners[0].1.key());
    }
}
