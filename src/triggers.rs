//! Deferred recalculation trigger queue.
//!
//! Posting a document records which registers need recomputing for which
//! period. The master session drains the queue in batches: entries are
//! claimed, collapsed to one calculation per (day, register), handed to the
//! caller's callbacks and then deleted. Documents on the ignore list (for
//! example while a user is still editing them) are skipped until the entry
//! is cleared or ages past the configured horizon.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{named_params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::{EngineError, Result};
use crate::reference::TaggedRef;
use crate::sessions::SessionContext;
use crate::storage::Database;
use crate::transactions::TxHandle;
use crate::value::FieldValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEntry {
    pub id: i64,
    pub written_at: i64,
    pub period: NaiveDateTime,
    pub register: String,
    pub document: TaggedRef,
    pub executed: bool,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The caller is not master; nothing was touched.
    NotMaster,
    Ran {
        /// Distinct (day, register) calculations performed.
        groups: usize,
        /// Queue entries consumed.
        entries: usize,
        /// Registers passed to the finalizer, sorted.
        registers: Vec<String>,
    },
}

pub struct TriggerQueue<'a> {
    db: &'a Database,
    clock: &'a dyn Clock,
}

impl<'a> TriggerQueue<'a> {
    pub fn new(db: &'a Database, clock: &'a dyn Clock) -> Self {
        Self { db, clock }
    }

    /// Append a trigger outside any transaction.
    pub fn record(&self, period: NaiveDateTime, document: &TaggedRef, register: &str, info: &str) -> Result<i64> {
        self.record_in(TxHandle::NONE, period, document, register, info)
    }

    /// Append a trigger on `handle`, so it commits or rolls back with the posting.
    pub fn record_in(
        &self,
        handle: TxHandle,
        period: NaiveDateTime,
        document: &TaggedRef,
        register: &str,
        info: &str,
    ) -> Result<i64> {
        if register.is_empty() {
            return Err(EngineError::validation("trigger register name must not be empty"));
        }
        let now = self.clock.now_millis();
        let id = self.db.with_connection(handle, |conn| {
            conn.execute(
                "INSERT INTO register_triggers (written_at, period, register_name, doc_type, document, executed, info)
                 VALUES (:now, :period, :register, :doc_type, :document, 0, :info)",
                named_params! {
                    ":now": now,
                    ":period": FieldValue::Date(period),
                    ":register": register,
                    ":doc_type": document.type_name,
                    ":document": document.uid,
                    ":info": info,
                },
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(id, register, %document, %period, "trigger recorded");
        Ok(id)
    }

    /// Drain the queue if `ctx` is master.
    ///
    /// `calc` runs once per distinct (day, register), ascending by day;
    /// `finalize` runs once with the sorted distinct registers when at least
    /// one calculation ran. If either callback fails the claimed entries are
    /// released for the next pass and the error is returned.
    pub fn run_pending<C, F>(&self, ctx: &SessionContext, mut calc: C, finalize: F) -> Result<RunOutcome>
    where
        C: FnMut(NaiveDate, &str) -> Result<()>,
        F: FnOnce(&[String]) -> Result<()>,
    {
        let cutoff = self.clock.now_millis() - self.db.config().doc_ignore_horizon_ms as i64;
        let claimed = self.db.with_write_lock(|conn| {
            if !holds_master(conn, ctx)? {
                return Ok(None);
            }
            claim(conn, cutoff).map(Some)
        })?;
        let Some(claimed) = claimed else {
            debug!(session = %ctx.session_id, "not master, skipping recalculation");
            return Ok(RunOutcome::NotMaster);
        };

        let mut groups: BTreeMap<(NaiveDate, String), usize> = BTreeMap::new();
        for (_, period, register) in &claimed {
            *groups.entry((period.date(), register.clone())).or_default() += 1;
        }
        let registers: Vec<String> = groups
            .keys()
            .map(|(_, r)| r.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ids: Vec<i64> = claimed.iter().map(|(id, _, _)| *id).collect();

        for ((day, register), count) in &groups {
            debug!(%day, register = register.as_str(), entries = count, "recalculating");
            if let Err(e) = calc(*day, register) {
                warn!(%day, register = register.as_str(), error = %e, "recalculation failed");
                self.release(&ids)?;
                return Err(EngineError::Recalculation {
                    register: register.clone(),
                    message: e.to_string(),
                });
            }
        }
        if !groups.is_empty() {
            if let Err(e) = finalize(&registers) {
                warn!(error = %e, "recalculation finalizer failed");
                self.release(&ids)?;
                return Err(e);
            }
        }

        let consumed = self.consume(&ids)?;
        if !groups.is_empty() {
            info!(groups = groups.len(), entries = consumed, registers = ?registers, "recalculation pass done");
        }
        Ok(RunOutcome::Ran {
            groups: groups.len(),
            entries: consumed,
            registers,
        })
    }

    /// Delete the entries this pass claimed. Entries claimed by another
    /// pass stay untouched.
    fn consume(&self, ids: &[i64]) -> Result<usize> {
        self.db.with_write_lock(|conn| {
            let mut stmt =
                conn.prepare("DELETE FROM register_triggers WHERE id = :id AND executed = 1")?;
            let mut consumed = 0;
            for id in ids {
                consumed += stmt.execute(named_params! { ":id": id })?;
            }
            Ok(consumed)
        })
    }

    fn release(&self, ids: &[i64]) -> Result<()> {
        let conn = self.db.pool().acquire()?;
        let mut stmt = conn.prepare("UPDATE register_triggers SET executed = 0 WHERE id = :id")?;
        for id in ids {
            stmt.execute(named_params! { ":id": id })?;
        }
        Ok(())
    }

    /// Suppress triggers of `document` for the calling session.
    pub fn add_ignore_for(&self, ctx: &SessionContext, document: &TaggedRef, info: &str) -> Result<()> {
        self.db.pool().acquire()?.execute(
            "INSERT INTO doc_ignore (written_at, user_name, session_id, document, info)
             VALUES (:now, :user, :sid, :document, :info)",
            named_params! {
                ":now": self.clock.now_millis(),
                ":user": ctx.user,
                ":sid": ctx.session_id,
                ":document": document.uid,
                ":info": info,
            },
        )?;
        debug!(%document, session = %ctx.session_id, "document ignored for recalculation");
        Ok(())
    }

    /// Drop the caller's ignore entries, for one document or all of them.
    pub fn clear_ignore_for(&self, ctx: &SessionContext, document: Option<&TaggedRef>) -> Result<usize> {
        let conn = self.db.pool().acquire()?;
        let removed = match document {
            Some(doc) => conn.execute(
                "DELETE FROM doc_ignore WHERE user_name = :user AND session_id = :sid AND document = :document",
                named_params! { ":user": ctx.user, ":sid": ctx.session_id, ":document": doc.uid },
            )?,
            None => conn.execute(
                "DELETE FROM doc_ignore WHERE user_name = :user AND session_id = :sid",
                named_params! { ":user": ctx.user, ":sid": ctx.session_id },
            )?,
        };
        Ok(removed)
    }

    /// Entries not yet consumed.
    pub fn pending_count(&self) -> Result<usize> {
        let n: i64 = self.db.pool().acquire()?.query_row(
            "SELECT COUNT(*) FROM register_triggers WHERE executed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn list_pending(&self) -> Result<Vec<TriggerEntry>> {
        let conn = self.db.pool().acquire()?;
        let mut stmt = conn.prepare(
            "SELECT id, written_at, period, register_name, doc_type, document, executed, info
             FROM register_triggers WHERE executed = 0 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(TriggerEntry {
                    id: row.get(0)?,
                    written_at: row.get(1)?,
                    period: row.get(2)?,
                    register: row.get(3)?,
                    document: TaggedRef::document(row.get::<_, String>(4)?, row.get(5)?),
                    executed: row.get(6)?,
                    info: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

fn holds_master(conn: &Connection, ctx: &SessionContext) -> Result<bool> {
    let flag: Option<bool> = conn
        .query_row(
            "SELECT is_master FROM sessions WHERE session_id = :sid",
            named_params! { ":sid": ctx.session_id },
            |row| row.get(0),
        )
        .optional()?;
    Ok(flag.unwrap_or(false))
}

/// Mark every eligible pending entry executed and return `(id, period, register)`.
fn claim(conn: &Connection, ignore_cutoff: i64) -> Result<Vec<(i64, NaiveDateTime, String)>> {
    let mut stmt = conn.prepare(
        "UPDATE register_triggers SET executed = 1
         WHERE executed = 0
           AND document NOT IN (SELECT document FROM doc_ignore WHERE written_at >= :cutoff)
         RETURNING id, period, register_name",
    )?;
    let claimed = stmt
        .query_map(named_params! { ":cutoff": ignore_cutoff }, |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(claimed)
}
