//! Auxiliary stores built on the engine primitives: per-session message
//! log, object version history and a full-text index.

pub mod fulltext;
pub mod messages;
pub mod versions;

pub use fulltext::FullTextIndex;
pub use messages::{Message, MessageLevel, MessageLog};
pub use versions::{VersionEntry, VersionHistory};
