//! Cache entry and read metadata.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::error::SyncError;

/// Snapshot of one domain partition: an ordered list of opaque records.
pub type Payload = Vec<serde_json::Value>;

/// A fetch that any number of readers can await; all of them get the same result.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Payload, SyncError>>>;

/// Last known state of one domain.
pub(crate) struct CacheEntry {
  pub payload: Option<Payload>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub expires_at: Instant,
  /// Optimistic patches applied and not yet confirmed or reverted
  pub pending_patches: usize,
  /// Bumped whenever a fetch already in flight must not land
  pub generation: u64,
  pub in_flight: Option<SharedFetch>,
}

impl CacheEntry {
  /// A new entry is stale until its first fetch lands.
  pub fn new() -> Self {
    Self {
      payload: None,
      fetched_at: None,
      expires_at: Instant::now(),
      pending_patches: 0,
      generation: 0,
      in_flight: None,
    }
  }

  pub fn is_fresh(&self, now: Instant) -> bool {
    self.payload.is_some() && now < self.expires_at
  }

  /// Replace the payload with an authoritative one.
  ///
  /// `pending_patches` is left alone; mutations still in flight settle it
  /// through confirm or revert.
  pub fn store(&mut self, payload: Payload, ttl: std::time::Duration) {
    self.payload = Some(payload);
    self.fetched_at = Some(Utc::now());
    self.expires_at = Instant::now() + ttl;
  }

  /// Mark stale without dropping the payload.
  pub fn expire(&mut self) {
    self.expires_at = Instant::now();
    self.generation += 1;
    self.in_flight = None;
  }

  pub fn read(&self, now: Instant) -> Option<CacheRead> {
    let payload = self.payload.clone()?;
    let source = if self.is_fresh(now) {
      CacheSource::CacheFresh
    } else {
      CacheSource::CacheStale
    };

    Some(CacheRead {
      data: payload,
      source,
      cached_at: self.fetched_at,
      provisional: self.pending_patches > 0,
    })
  }
}

/// Result of a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheRead {
  /// The actual data
  pub data: Payload,
  /// Where the data came from
  pub source: CacheSource,
  /// When the authoritative payload was fetched (None if it never was)
  pub cached_at: Option<DateTime<Utc>>,
  /// Whether an unconfirmed optimistic patch is part of `data`
  pub provisional: bool,
}

impl CacheRead {
  /// Create a cache read from a fetch that just completed.
  pub fn from_network(data: Payload) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: Some(Utc::now()),
      provisional: false,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within its TTL
  CacheFresh,
  /// Last-known data past its TTL or explicitly invalidated
  CacheStale,
}
