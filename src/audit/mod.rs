//! Append-only audit trail of committed mutations.
//!
//! One record per committed mutation (plus one per successful undo restore),
//! written after the commit and never before. Records are never updated or
//! deleted here; retention is someone else's policy.

mod record;
mod recorder;
mod sqlite;
mod store;

pub use record::{AuditAction, AuditEntry, AuditFilter, AuditRecord};
pub use recorder::AuditLogRecorder;
pub use sqlite::SqliteAuditStore;
pub use store::{AuditStore, MemoryAuditStore};
