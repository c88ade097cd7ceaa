use std::sync::Arc;
use std::time::Duration;

use color_eyre::{Report, Result};
use tracing::{debug, warn};

use super::record::{AuditEntry, AuditFilter, AuditRecord};
use super::store::AuditStore;
use crate::timeout::run_with_timeout;

/// Best-effort front for an [`AuditStore`].
///
/// Writes are bounded by a deadline. A write that fails or times out is logged
/// and dropped: the mutation it describes has already committed and is never
/// rolled back because of it.
#[derive(Clone)]
pub struct AuditLogRecorder {
  store: Arc<dyn AuditStore>,
  write_timeout: Duration,
}

impl AuditLogRecorder {
  pub fn new(store: Arc<dyn AuditStore>, write_timeout: Duration) -> Self {
    Self {
      store,
      write_timeout,
    }
  }

  /// Append an entry. Returns the stored record, or `None` if persisting failed.
  pub async fn record(&self, entry: AuditEntry) -> Option<AuditRecord> {
    let description = format!(
      "{} {} {}",
      entry.action, entry.entity_type, entry.entity_id
    );
    let message = format!(
      "audit write for {} exceeded {}ms",
      description,
      self.write_timeout.as_millis()
    );

    let result: Result<AuditRecord, Report> =
      run_with_timeout(self.store.append(entry), self.write_timeout, message).await;

    match result {
      Ok(record) => {
        debug!(id = record.id, %description, "audit record stored");
        Some(record)
      }
      Err(e) => {
        warn!(%description, error = %e, "failed to persist audit record");
        None
      }
    }
  }

  /// Records matching `filter`, newest first.
  pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
    self.store.query(filter).await
  }
}
