//! Declarative query model and its SQL compiler.

pub mod compile;
pub mod spec;

pub use compile::{compile, compile_hierarchical, CompiledQuery, LEVEL_COLUMN};
pub use spec::{
    Comparator, Connective, Join, JoinKind, Predicate, QuerySpec, SortDirection, SqlFunction,
};

/// Primary-key column every object table carries.
pub const UID_FIELD: &str = "uid";
