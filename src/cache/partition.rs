//! Cache partition manager: one entry per domain, fetch deduplication, optimistic patches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheRead, Payload, SharedFetch};
use super::settings::CacheSettings;
use crate::error::SyncError;
use crate::remote::RemoteStore;
use crate::timeout::run_with_timeout;

type Entries = Arc<Mutex<HashMap<String, CacheEntry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
  entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves domain payloads from memory, fetching through the remote store when stale.
///
/// The entry map is only ever written from here. No lock is held across an
/// await; the only suspension point is the shared fetch itself.
pub struct CachePartitionManager {
  remote: Arc<dyn RemoteStore>,
  settings: CacheSettings,
  entries: Entries,
}

impl CachePartitionManager {
  pub fn new(remote: Arc<dyn RemoteStore>, settings: CacheSettings) -> Self {
    Self {
      remote,
      settings,
      entries: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  /// Return the domain's payload, fetching it if absent or stale.
  pub async fn get(&self, domain: &str) -> Result<Payload, SyncError> {
    self.get_with_meta(domain).await.map(|read| read.data)
  }

  /// Like [`get`](Self::get), but also reports where the data came from.
  ///
  /// 1. Fresh entry: return it, no I/O
  /// 2. Fetch already in flight: wait on it
  /// 3. Otherwise start exactly one fetch and wait on it
  ///
  /// A failed fetch leaves the previous payload in place; see [`peek`](Self::peek).
  pub async fn get_with_meta(&self, domain: &str) -> Result<CacheRead, SyncError> {
    let fetch = {
      let mut entries = lock(&self.entries);
      let entry = entries
        .entry(domain.to_string())
        .or_insert_with(CacheEntry::new);

      let now = Instant::now();
      if entry.is_fresh(now) {
        if let Some(read) = entry.read(now) {
          debug!(domain, "cache hit");
          return Ok(read);
        }
      }

      match entry.in_flight.clone() {
        Some(fetch) => {
          debug!(domain, "joining in-flight fetch");
          fetch
        }
        None => {
          debug!(domain, generation = entry.generation, "starting fetch");
          let fetch = self.start_fetch(domain, entry.generation);
          entry.in_flight = Some(fetch.clone());
          fetch
        }
      }
    };

    fetch.await.map(CacheRead::from_network)
  }

  /// Last-known data for a domain without triggering any I/O.
  pub fn peek(&self, domain: &str) -> Option<CacheRead> {
    let entries = lock(&self.entries);
    entries.get(domain)?.read(Instant::now())
  }

  /// Current payload, used as the pre-mutation snapshot for rollback.
  pub fn snapshot(&self, domain: &str) -> Option<Payload> {
    let entries = lock(&self.entries);
    entries.get(domain)?.payload.clone()
  }

  /// Mark a domain stale. The payload stays for display; the next `get` refetches.
  ///
  /// A fetch already in flight is detached: its waiters still get its result,
  /// but it will not overwrite the entry.
  pub fn invalidate(&self, domain: &str) {
    let mut entries = lock(&self.entries);
    if let Some(entry) = entries.get_mut(domain) {
      entry.expire();
      debug!(domain, "invalidated");
    }
  }

  pub fn invalidate_all(&self) {
    let mut entries = lock(&self.entries);
    for entry in entries.values_mut() {
      entry.expire();
    }
    debug!(domains = entries.len(), "invalidated all domains");
  }

  /// Transform the cached payload in place and mark it provisional.
  ///
  /// A domain that was never fetched is patched starting from an empty payload
  /// and stays stale, so the next `get` still goes to the network.
  pub fn apply_optimistic_patch<F>(&self, domain: &str, patch: F)
  where
    F: FnOnce(&Payload) -> Payload,
  {
    let mut entries = lock(&self.entries);
    let entry = entries
      .entry(domain.to_string())
      .or_insert_with(CacheEntry::new);

    let current = entry.payload.take().unwrap_or_default();
    entry.payload = Some(patch(&current));
    entry.pending_patches += 1;
    // A fetch started before the patch would wipe it on landing
    entry.generation += 1;
    entry.in_flight = None;
  }

  /// Restore a previously captured payload after a failed mutation.
  pub fn revert_optimistic_patch(&self, domain: &str, previous: Option<Payload>) {
    self.revert_with(domain, |_| previous);
  }

  /// Revert by computing the restored payload from the current one, atomically.
  ///
  /// Used to undo a single entity's patch without disturbing patches other
  /// mutations applied, or fetches that landed, in the meantime. The entry is
  /// marked stale either way: a reverted payload is never served as fresh.
  pub fn revert_with<F>(&self, domain: &str, restore: F)
  where
    F: FnOnce(Option<&Payload>) -> Option<Payload>,
  {
    let mut entries = lock(&self.entries);
    if let Some(entry) = entries.get_mut(domain) {
      entry.payload = restore(entry.payload.as_ref());
      entry.pending_patches = entry.pending_patches.saturating_sub(1);
      entry.expire();
      debug!(domain, "optimistic patch reverted");
    }
  }

  /// A patch was confirmed by the server; it stops counting as provisional.
  ///
  /// `reconcile` folds the server's response into the patched payload (or
  /// returns it unchanged to keep the optimistic result).
  pub fn confirm_optimistic_patch<F>(&self, domain: &str, reconcile: F)
  where
    F: FnOnce(&Payload) -> Payload,
  {
    let mut entries = lock(&self.entries);
    if let Some(entry) = entries.get_mut(domain) {
      if let Some(payload) = entry.payload.take() {
        entry.payload = Some(reconcile(&payload));
      }
      entry.pending_patches = entry.pending_patches.saturating_sub(1);
    }
  }

  fn start_fetch(&self, domain: &str, generation: u64) -> SharedFetch {
    let remote = Arc::clone(&self.remote);
    let entries = Arc::clone(&self.entries);
    let domain = domain.to_string();
    let ttl = self.settings.ttl_for(&domain);
    let timeout = self.settings.fetch_timeout;

    async move {
      let message = format!(
        "fetching {} exceeded {}ms",
        domain,
        timeout.as_millis()
      );
      let result = run_with_timeout(remote.fetch_domain(&domain), timeout, message).await;
      settle_fetch(&entries, &domain, generation, &result, ttl);
      result
    }
    .boxed()
    .shared()
  }
}

/// Land a completed fetch in its entry, unless the entry moved on meanwhile.
fn settle_fetch(
  entries: &Entries,
  domain: &str,
  generation: u64,
  result: &Result<Payload, SyncError>,
  ttl: std::time::Duration,
) {
  let mut entries = lock(entries);
  let Some(entry) = entries.get_mut(domain) else {
    return;
  };

  if entry.generation != generation {
    debug!(domain, generation, current = entry.generation, "discarding superseded fetch");
    return;
  }

  entry.in_flight = None;
  match result {
    Ok(payload) => {
      debug!(domain, records = payload.len(), "fetch stored");
      entry.store(payload.clone(), ttl);
    }
    Err(e) => {
      warn!(domain, error = %e, "fetch failed, keeping last-known payload");
    }
  }
}
