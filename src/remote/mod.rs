//! Remote data-access layer consumed by the cache and the mutation coordinator.
//!
//! The concrete backend is external; this module only fixes the two shapes the
//! core needs and ships two implementations:
//! - [`HttpRemote`] talks to a REST-style backend
//! - [`MemoryRemote`] keeps everything in process (tests, demos, offline use)

mod http;
mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::Payload;
use crate::error::SyncError;
use crate::mutation::MutationKind;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

/// Authoritative store behind the cache.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Fetch the full payload of one domain partition.
  async fn fetch_domain(&self, domain: &str) -> Result<Payload, SyncError>;

  /// Apply one write. Returns the server's view of the entity, if it sends one back.
  async fn write_entity(
    &self,
    domain: &str,
    kind: MutationKind,
    payload: &Value,
  ) -> Result<Option<Value>, SyncError>;
}
