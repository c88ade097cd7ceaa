use std::time::Duration;

use super::types::MutationKind;
use crate::error::SyncError;

/// Bounded retry with capped exponential backoff.
///
/// Retry `n` (counting from 0) waits `base_delay * 2^n`, never more than `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub create_retries: u32,
  pub update_retries: u32,
  pub delete_retries: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(30),
      create_retries: 2,
      update_retries: 2,
      delete_retries: 1,
    }
  }
}

impl RetryPolicy {
  /// Retries allowed after the first attempt.
  pub fn max_retries(&self, kind: MutationKind) -> u32 {
    match kind {
      MutationKind::Create => self.create_retries,
      MutationKind::Update => self.update_retries,
      MutationKind::Delete => self.delete_retries,
    }
  }

  pub fn delay_for(&self, retry: u32) -> Duration {
    self
      .base_delay
      .checked_mul(2u32.saturating_pow(retry))
      .map_or(self.max_delay, |d| d.min(self.max_delay))
  }

  /// Whether a failure after `retries_done` retries should be retried again.
  pub fn should_retry(&self, kind: MutationKind, error: &SyncError, retries_done: u32) -> bool {
    error.is_transient() && retries_done < self.max_retries(kind)
  }
}
