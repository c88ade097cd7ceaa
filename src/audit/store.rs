//! Audit store trait and in-memory implementation.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use color_eyre::Result;

use super::record::{AuditEntry, AuditFilter, AuditRecord};

/// Append-only audit persistence with a query surface.
///
/// Query results are returned newest first.
#[async_trait]
pub trait AuditStore: Send + Sync {
  /// Persist one entry, returning the stored record.
  async fn append(&self, entry: AuditEntry) -> Result<AuditRecord>;

  /// Records matching the filter, newest first.
  async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>>;

  /// Total number of stored records.
  async fn count(&self) -> Result<usize>;
}

/// Newest first: by timestamp, then by insertion order for equal timestamps.
pub(crate) fn sort_newest_first(records: &mut [AuditRecord]) {
  records.sort_by(|a, b| {
    b.recorded_at
      .cmp(&a.recorded_at)
      .then_with(|| b.id.cmp(&a.id))
  });
}

/// Audit store kept in process memory.
#[derive(Default)]
pub struct MemoryAuditStore {
  records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
  async fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
    let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
    let record = AuditRecord::from_entry(records.len() as u64 + 1, entry);
    records.push(record.clone());
    Ok(record)
  }

  async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
    let mut matching: Vec<AuditRecord> = {
      let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
      records
        .iter()
        .filter(|r| filter.matches(r))
        .cloned()
        .collect()
    };

    sort_newest_first(&mut matching);
    if let Some(limit) = filter.limit {
      matching.truncate(limit);
    }
    Ok(matching)
  }

  async fn count(&self) -> Result<usize> {
    Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner).len())
  }
}
