//! Partitioned, time-bounded cache of remote data.
//!
//! Each logical domain ("tasks", "crm", ...) has exactly one entry that:
//! - is served from memory while fresh
//! - is refetched at most once at a time when stale (concurrent readers share the fetch)
//! - keeps its last-known payload when a refresh fails
//! - can carry a provisional optimistic patch until the next authoritative fetch
//!
//! The manager knows nothing about mutations. It only exposes the apply/revert
//! primitives; deciding when to use them is the coordinator's job.

mod entry;
mod partition;
mod settings;

pub use entry::{CacheRead, CacheSource, Payload};
pub use partition::CachePartitionManager;
pub use settings::CacheSettings;
