//! Persistence and coordination engine for a metadata-driven
//! ERP platform.
//!
//! Provides the query builder (including recursive hierarchy queries),
//! handle-addressed transactions, advisory object locks, session tracking
//! with master election, and the deferred register-recalculation queue, all
//! on one shared SQLite database.

pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod locks;
pub mod objects;
pub mod query;
pub mod reference;
pub mod sessions;
pub mod storage;
pub mod stores;
pub mod transactions;
pub mod triggers;
pub mod uid;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{EngineError, Result};
pub use locks::{LockEntry, LockOutcome, LockRegistry};
pub use objects::{BusinessObject, ObjectKind, ObjectMeta, ObjectStore};
pub use query::{CompiledQuery, Comparator, Connective, Join, Predicate, QuerySpec, SortDirection};
pub use reference::{ObjectGroup, TaggedRef};
pub use sessions::{ClientKind, HeartbeatWorker, MaintenanceReport, SessionContext, SessionEntry, SessionRegistry};
pub use storage::{Database, Row};
pub use transactions::{TransactionMode, TxHandle};
pub use triggers::{RunOutcome, TriggerEntry, TriggerQueue};
pub use uid::UniqueId;
pub use value::{FieldType, FieldValue};
