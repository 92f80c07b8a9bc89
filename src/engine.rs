//! The engine: one attached database plus a clock, handing out the
//! registries that operate on it.
//!
//! `Engine` is cheap to clone. Several engines (or several sessions on one
//! engine) may work on the same database file at once; all coordination
//! goes through the database.

use std::path::Path;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::locks::LockRegistry;
use crate::objects::ObjectStore;
use crate::sessions::SessionRegistry;
use crate::storage::Database;
use crate::stores::{FullTextIndex, MessageLog, VersionHistory};
use crate::triggers::TriggerQueue;
use crate::uid::UniqueId;

struct Shared {
    db: Database,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Engine on the wall clock.
    pub fn new(db: Database) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared { db, clock }),
        }
    }

    /// Create a database and attach to it.
    pub fn create(data_dir: impl AsRef<Path>, name: &str, config: EngineConfig) -> Result<Self> {
        Ok(Self::new(Database::create(data_dir, name, config)?))
    }

    /// Attach to an existing database.
    pub fn open(data_dir: impl AsRef<Path>, name: &str, config: EngineConfig) -> Result<Self> {
        Ok(Self::new(Database::open(data_dir, name, config)?))
    }

    pub fn database(&self) -> &Database {
        &self.shared.db
    }

    pub fn config(&self) -> &EngineConfig {
        self.shared.db.config()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.shared.clock.as_ref()
    }

    pub fn create_user(&self, name: &str, password: &str) -> Result<UniqueId> {
        self.sessions().create_user(name, password)
    }

    pub fn sessions(&self) -> SessionRegistry<'_> {
        SessionRegistry::new(self.database(), self.clock())
    }

    pub fn locks(&self) -> LockRegistry<'_> {
        LockRegistry::new(self.database(), self.clock())
    }

    pub fn triggers(&self) -> TriggerQueue<'_> {
        TriggerQueue::new(self.database(), self.clock())
    }

    pub fn objects(&self) -> ObjectStore<'_> {
        ObjectStore::new(self)
    }

    pub fn messages(&self) -> MessageLog<'_> {
        MessageLog::new(self.database(), self.clock())
    }

    pub fn versions(&self) -> VersionHistory<'_> {
        VersionHistory::new(self.database(), self.clock())
    }

    pub fn fulltext(&self) -> FullTextIndex<'_> {
        FullTextIndex::new(self.database(), self.clock())
    }
}
