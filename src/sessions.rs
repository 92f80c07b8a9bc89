//! Session registry and master election.
//!
//! Every connected instance keeps one row in `sessions` fresh through
//! heartbeats. The maintenance pass evicts stale rows (with their locks) and
//! makes sure exactly one active, eligible session holds the master flag.

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{named_params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::storage::{Database, NamedParams};
use crate::uid::UniqueId;

/// Kind of client behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Desktop,
    Web,
    Service,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Web => "web",
            Self::Service => "service",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(Self::Desktop),
            "web" => Ok(Self::Web),
            "service" => Ok(Self::Service),
            other => Err(EngineError::validation(format!("unknown client kind: {other:?}"))),
        }
    }
}

impl ToSql for ClientKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ClientKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::parse(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is calling: passed to every session-scoped operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user: String,
    pub session_id: UniqueId,
    pub kind: ClientKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub session_id: UniqueId,
    pub user: String,
    pub kind: ClientKind,
    pub login_at: i64,
    pub heartbeat_at: i64,
    pub is_master: bool,
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: Vec<UniqueId>,
    pub demoted: Vec<UniqueId>,
    pub promoted: Option<UniqueId>,
    /// Locks whose session no longer exists.
    pub orphaned_locks: usize,
    /// Master after the pass, if any.
    pub master: Option<UniqueId>,
}

const SESSION_COLUMNS: &str = "session_id, user_name, client_kind, login_at, heartbeat_at, is_master";

fn read_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionEntry> {
    Ok(SessionEntry {
        session_id: row.get(0)?,
        user: row.get(1)?,
        kind: row.get(2)?,
        login_at: row.get(3)?,
        heartbeat_at: row.get(4)?,
        is_master: row.get(5)?,
    })
}

fn load_sessions(
    conn: &Connection,
    filter: &str,
    params: &NamedParams<'_>,
) -> Result<Vec<SessionEntry>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions {filter} ORDER BY login_at ASC, session_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params, read_session)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub struct SessionRegistry<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> SessionRegistry<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    /// Register a user. Names are unique.
    pub fn create_user(&self, name: &str, password: &str) -> Result<UniqueId> {
        if name.trim().is_empty() {
            return Err(EngineError::validation("user name must not be empty"));
        }
        let uid = UniqueId::new();
        let inserted = self.db.pool().acquire()?.execute(
            "INSERT OR IGNORE INTO users (uid, name, password, created_at)
             VALUES (:uid, :name, :password, :now)",
            named_params! {
                ":uid": uid,
                ":name": name,
                ":password": password,
                ":now": self.clock.now_millis(),
            },
        )?;
        if inserted == 0 {
            return Err(EngineError::validation(format!("user {name:?} already exists")));
        }
        info!(user = name, "user created");
        Ok(uid)
    }

    /// Check credentials and open a session, then run a maintenance pass so a
    /// first eligible session becomes master right away.
    pub fn login(&self, user: &str, password: &str, kind: ClientKind) -> Result<SessionContext> {
        let stored: Option<String> = self
            .db
            .pool()
            .acquire()?
            .query_row(
                "SELECT password FROM users WHERE name = :name",
                named_params! { ":name": user },
                |row| row.get(0),
            )
            .optional()?;
        if stored.as_deref() != Some(password) {
            warn!(user, "login rejected");
            return Err(EngineError::validation("invalid user name or password"));
        }

        let ctx = SessionContext {
            user: user.to_string(),
            session_id: UniqueId::new(),
            kind,
        };
        let now = self.clock.now_millis();
        self.db.pool().acquire()?.execute(
            "INSERT INTO sessions (session_id, user_name, client_kind, login_at, heartbeat_at, is_master)
             VALUES (:sid, :user, :kind, :now, :now, 0)",
            named_params! {
                ":sid": ctx.session_id,
                ":user": ctx.user,
                ":kind": kind,
                ":now": now,
            },
        )?;
        info!(user, session = %ctx.session_id, %kind, "session opened");
        self.maintain()?;
        Ok(ctx)
    }

    /// Close a session and release its locks. Returns whether it was registered.
    pub fn logout(&self, ctx: &SessionContext) -> Result<bool> {
        let removed = self.db.with_write_lock(|conn| {
            conn.execute(
                "DELETE FROM locked_objects WHERE session_id = :sid",
                named_params! { ":sid": ctx.session_id },
            )?;
            Ok(conn.execute(
                "DELETE FROM sessions WHERE session_id = :sid",
                named_params! { ":sid": ctx.session_id },
            )?)
        })?;
        info!(user = %ctx.user, session = %ctx.session_id, "session closed");
        if removed > 0 {
            self.maintain()?;
        }
        Ok(removed > 0)
    }

    /// Refresh the caller's heartbeat. `false` if the session is gone.
    pub fn heartbeat(&self, ctx: &SessionContext) -> Result<bool> {
        let updated = self.db.pool().acquire()?.execute(
            "UPDATE sessions SET heartbeat_at = :now WHERE session_id = :sid",
            named_params! { ":now": self.clock.now_millis(), ":sid": ctx.session_id },
        )?;
        debug!(session = %ctx.session_id, found = updated > 0, "heartbeat");
        Ok(updated > 0)
    }

    /// Evict stale sessions, demote inactive masters and elect a master.
    ///
    /// Runs as one immediate transaction, so concurrent passes from other
    /// instances serialize on the database write lock.
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        let config = self.db.config();
        let now = self.clock.now_millis();
        let stale_cutoff = now - config.stale_threshold_ms as i64;
        let active_cutoff = now - config.active_threshold_ms as i64;

        let report = self.db.with_write_lock(|conn| {
            let mut report = MaintenanceReport::default();

            let stale = load_sessions(
                conn,
                "WHERE heartbeat_at < :cutoff",
                named_params! { ":cutoff": stale_cutoff },
            )?;
            for entry in &stale {
                conn.execute(
                    "DELETE FROM locked_objects WHERE session_id = :sid",
                    named_params! { ":sid": entry.session_id },
                )?;
                conn.execute(
                    "DELETE FROM sessions WHERE session_id = :sid",
                    named_params! { ":sid": entry.session_id },
                )?;
                report.evicted.push(entry.session_id);
            }
            report.orphaned_locks = conn.execute(
                "DELETE FROM locked_objects
                 WHERE session_id NOT IN (SELECT session_id FROM sessions)",
                [],
            )?;

            let live = load_sessions(conn, "", &[])?;
            let can_lead = |s: &SessionEntry| {
                s.heartbeat_at >= active_cutoff && config.is_master_eligible(s.kind)
            };
            let keeper = live.iter().find(|s| s.is_master && can_lead(*s));
            let chosen = keeper.or_else(|| live.iter().find(|s| can_lead(*s)));
            let chosen_id = chosen.map(|s| s.session_id);

            for s in live.iter().filter(|s| s.is_master && Some(s.session_id) != chosen_id) {
                conn.execute(
                    "UPDATE sessions SET is_master = 0 WHERE session_id = :sid",
                    named_params! { ":sid": s.session_id },
                )?;
                report.demoted.push(s.session_id);
            }
            if let Some(s) = chosen.filter(|s| !s.is_master) {
                conn.execute(
                    "UPDATE sessions SET is_master = 1 WHERE session_id = :sid",
                    named_params! { ":sid": s.session_id },
                )?;
                report.promoted = Some(s.session_id);
            }
            report.master = chosen_id;
            Ok(report)
        })?;

        for sid in &report.evicted {
            warn!(session = %sid, "evicted stale session");
        }
        if report.orphaned_locks > 0 {
            warn!(count = report.orphaned_locks, "released locks of missing sessions");
        }
        for sid in &report.demoted {
            info!(session = %sid, "master demoted");
        }
        if let Some(sid) = &report.promoted {
            info!(session = %sid, "master promoted");
        }
        Ok(report)
    }

    pub fn is_master(&self, ctx: &SessionContext) -> Result<bool> {
        let flag: Option<bool> = self
            .db
            .pool()
            .acquire()?
            .query_row(
                "SELECT is_master FROM sessions WHERE session_id = :sid",
                named_params! { ":sid": ctx.session_id },
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    pub fn master(&self) -> Result<Option<SessionEntry>> {
        let conn = self.db.pool().acquire()?;
        Ok(load_sessions(&conn, "WHERE is_master = 1", &[])?.into_iter().next())
    }

    pub fn get(&self, session_id: UniqueId) -> Result<Option<SessionEntry>> {
        let conn = self.db.pool().acquire()?;
        Ok(load_sessions(
            &conn,
            "WHERE session_id = :sid",
            named_params! { ":sid": session_id },
        )?
        .into_iter()
        .next())
    }

    /// All registered sessions, oldest login first.
    pub fn list(&self) -> Result<Vec<SessionEntry>> {
        let conn = self.db.pool().acquire()?;
        load_sessions(&conn, "", &[])
    }
}

/// Background thread that heartbeats one session and runs maintenance at
/// the configured interval. Stops on [`HeartbeatWorker::stop`] or drop.
pub struct HeartbeatWorker {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatWorker {
    pub fn spawn(engine: Engine, ctx: SessionContext) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = engine.config().heartbeat_interval();
        let thread = std::thread::Builder::new()
            .name(format!("heartbeat-{}", ctx.session_id))
            .spawn(move || loop {
                let sessions = engine.sessions();
                match sessions.heartbeat(&ctx) {
                    Ok(true) => {}
                    Ok(false) => warn!(session = %ctx.session_id, "heartbeat for unknown session"),
                    Err(e) => warn!(session = %ctx.session_id, error = %e, "heartbeat failed"),
                }
                if let Err(e) = sessions.maintain() {
                    warn!(session = %ctx.session_id, error = %e, "maintenance failed");
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to finish its current beat.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use std::sync::Arc;

    const START: i64 = 1_700_000_000_000;

    fn setup(config: EngineConfig) -> (tempfile::TempDir, Engine, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let db = Database::create(dir.path(), "erp", config).unwrap();
        let engine = Engine::with_clock(db, clock.clone());
        engine.create_user("alice", "secret").unwrap();
        engine.create_user("bob", "hunter2").unwrap();
        (dir, engine, clock)
    }

    #[test]
    fn test_create_user_rejects_duplicates() {
        let (_dir, engine, _clock) = setup(EngineConfig::default());
        let err = engine.create_user("alice", "x").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.create_user("  ", "x").is_err());
    }

    #[test]
    fn test_login_checks_password() {
        let (_dir, engine, _clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        assert!(matches!(
            sessions.login("alice", "wrong", ClientKind::Desktop),
            Err(EngineError::Validation(_))
        ));
        assert!(sessions.login("nobody", "secret", ClientKind::Desktop).is_err());

        let ctx = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        assert_eq!(ctx.user, "alice");
        let entry = sessions.get(ctx.session_id).unwrap().unwrap();
        assert_eq!(entry.login_at, START);
        assert_eq!(entry.kind, ClientKind::Desktop);
    }

    #[test]
    fn test_first_eligible_login_becomes_master() {
        let (_dir, engine, _clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        let web = sessions.login("bob", "hunter2", ClientKind::Web).unwrap();
        assert!(!sessions.is_master(&web).unwrap());
        assert!(sessions.master().unwrap().is_none());

        let desk = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        assert!(sessions.is_master(&desk).unwrap());

        let desk2 = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        assert!(!sessions.is_master(&desk2).unwrap());
        assert_eq!(sessions.master().unwrap().unwrap().session_id, desk.session_id);
    }

    #[test]
    fn test_heartbeat_reports_missing_session() {
        let (_dir, engine, clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        let ctx = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        clock.advance(1_000);
        assert!(sessions.heartbeat(&ctx).unwrap());
        assert_eq!(sessions.get(ctx.session_id).unwrap().unwrap().heartbeat_at, START + 1_000);

        assert!(sessions.logout(&ctx).unwrap());
        assert!(!sessions.heartbeat(&ctx).unwrap());
        assert!(!sessions.logout(&ctx).unwrap());
    }

    #[test]
    fn test_stale_master_replaced_by_active_eligible_session() {
        let (_dir, engine, clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        let first = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        let second = sessions.login("bob", "hunter2", ClientKind::Desktop).unwrap();
        let web = sessions.login("bob", "hunter2", ClientKind::Web).unwrap();
        assert!(sessions.is_master(&first).unwrap());

        // Everyone but `first` keeps beating past the stale threshold.
        for _ in 0..20 {
            clock.advance(20_000);
            sessions.heartbeat(&second).unwrap();
            sessions.heartbeat(&web).unwrap();
        }
        let report = sessions.maintain().unwrap();
        assert_eq!(report.evicted, vec![first.session_id]);
        assert_eq!(report.promoted, Some(second.session_id));
        assert_eq!(report.master, Some(second.session_id));

        let masters: Vec<_> = sessions.list().unwrap().into_iter().filter(|s| s.is_master).collect();
        assert_eq!(masters.len(), 1);
        assert!(sessions.get(first.session_id).unwrap().is_none());
    }

    #[test]
    fn test_inactive_master_demoted_before_eviction() {
        let (_dir, engine, clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        let first = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        let second = sessions.login("bob", "hunter2", ClientKind::Desktop).unwrap();

        clock.advance(90_000);
        sessions.heartbeat(&second).unwrap();
        let report = sessions.maintain().unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.demoted, vec![first.session_id]);
        assert_eq!(report.master, Some(second.session_id));
        assert!(sessions.get(first.session_id).unwrap().is_some());
    }

    #[test]
    fn test_no_master_without_active_eligible_sessions() {
        let (_dir, engine, clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        let desk = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        let web = sessions.login("bob", "hunter2", ClientKind::Web).unwrap();
        assert!(sessions.is_master(&desk).unwrap());

        for _ in 0..20 {
            clock.advance(20_000);
            sessions.heartbeat(&web).unwrap();
        }
        let report = sessions.maintain().unwrap();
        assert_eq!(report.evicted, vec![desk.session_id]);
        assert_eq!(report.master, None);
        assert!(!sessions.is_master(&web).unwrap());
    }

    #[test]
    fn test_eviction_cascades_locks() {
        let (_dir, engine, clock) = setup(EngineConfig::default());
        let sessions = engine.sessions();
        let ctx = sessions.login("alice", "secret", ClientKind::Web).unwrap();
        let target = crate::reference::TaggedRef::document("Invoice", UniqueId::new());
        engine.locks().try_lock(&ctx, &target).unwrap();
        assert!(engine.locks().lock_info(&target).unwrap().is_some());

        clock.advance(400_000);
        sessions.maintain().unwrap();
        assert!(engine.locks().lock_info(&target).unwrap().is_none());
    }

    #[test]
    fn test_configured_eligibility() {
        let config = EngineConfig {
            master_eligible: vec![ClientKind::Service],
            ..EngineConfig::default()
        };
        let (_dir, engine, _clock) = setup(config);
        let sessions = engine.sessions();
        let desk = sessions.login("alice", "secret", ClientKind::Desktop).unwrap();
        let svc = sessions.login("bob", "hunter2", ClientKind::Service).unwrap();
        assert!(!sessions.is_master(&desk).unwrap());
        assert!(sessions.is_master(&svc).unwrap());
    }

    #[test]
    fn test_heartbeat_worker_beats_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            heartbeat_interval_ms: 10,
            active_threshold_ms: 1_000,
            stale_threshold_ms: 5_000,
            ..EngineConfig::default()
        };
        let db = Database::create(dir.path(), "erp", config).unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let engine = Engine::with_clock(db, clock.clone());
        engine.create_user("alice", "secret").unwrap();
        let ctx = engine.sessions().login("alice", "secret", ClientKind::Desktop).unwrap();

        clock.advance(500);
        let worker = HeartbeatWorker::spawn(engine.clone(), ctx.clone()).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let beat = engine.sessions().get(ctx.session_id).unwrap().unwrap().heartbeat_at;
            if beat == START + 500 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "worker never beat");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        worker.stop();

        clock.advance(500);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let beat = engine.sessions().get(ctx.session_id).unwrap().unwrap().heartbeat_at;
        assert_eq!(beat, START + 500);
    }

    #[test]
    fn test_client_kind_text() {
        for kind in [ClientKind::Desktop, ClientKind::Web, ClientKind::Service] {
            assert_eq!(ClientKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ClientKind::parse("mainframe").is_err());
    }
}
