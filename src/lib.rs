//! Client-side sync layer for domain-partitioned remote data.
//!
//! Reads are served from a per-domain cache with TTL freshness and fetch
//! deduplication. Writes are applied optimistically, sent to the remote store
//! with a deadline and bounded retry, then either committed (invalidate, audit,
//! undo offer for deletes) or rolled back to the pre-mutation snapshot.
//!
//! ```no_run
//! use std::sync::Arc;
//! use optisync::{remote::MemoryRemote, SyncClient};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SyncClient::builder(Arc::new(MemoryRemote::new())).build();
//! let outcome = client.create("tasks", json!({"title": "Write docs"})).await?;
//! let tasks = client.get("tasks").await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mutation;
pub mod notify;
pub mod records;
pub mod remote;
pub mod timeout;
pub mod undo;

pub use client::{SyncClient, SyncClientBuilder};
pub use config::Config;
pub use error::{ErrorKind, MutationFailure, SyncError};
pub use mutation::{MutationId, MutationKind, MutationOutcome, MutationRequest, MutationStatus, SubmitOptions};
pub use undo::{UndoHandle, UndoOutcome};
