//! Error taxonomy for remote reads and writes.
//!
//! Every failure coming back from the remote store is classified into one of
//! five kinds. Timeout and network failures are transient and get retried by
//! the mutation coordinator; everything else is permanent and triggers a
//! rollback.

use thiserror::Error;

use crate::mutation::{MutationId, MutationStatus};
use crate::timeout::TimeoutError;

/// Classified failure of a remote operation.
///
/// `Clone` so a deduplicated fetch can hand the same error to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Deadline exceeded before the remote call completed
  #[error("timed out: {message}")]
  Timeout { message: String },

  /// Transport failure (connection refused, reset, gateway errors)
  #[error("network error: {message}")]
  Network { message: String },

  /// Server rejected the write because the record changed elsewhere
  #[error("conflict: {message}")]
  Conflict { message: String },

  /// Server-side validation rejected the payload
  #[error("validation failed: {message}")]
  Validation { message: String },

  /// Anything we could not classify
  #[error("fatal: {message}")]
  Fatal { message: String },
}

/// Discriminant of [`SyncError`], handy for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Timeout,
  Network,
  Conflict,
  Validation,
  Fatal,
}

impl SyncError {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      message: message.into(),
    }
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::Conflict {
      message: message.into(),
    }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn fatal(message: impl Into<String>) -> Self {
    Self::Fatal {
      message: message.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Timeout { .. } => ErrorKind::Timeout,
      Self::Network { .. } => ErrorKind::Network,
      Self::Conflict { .. } => ErrorKind::Conflict,
      Self::Validation { .. } => ErrorKind::Validation,
      Self::Fatal { .. } => ErrorKind::Fatal,
    }
  }

  /// Raw message without the kind prefix.
  pub fn message(&self) -> &str {
    match self {
      Self::Timeout { message }
      | Self::Network { message }
      | Self::Conflict { message }
      | Self::Validation { message }
      | Self::Fatal { message } => message,
    }
  }

  /// Whether the failure is worth retrying.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Timeout { .. } | Self::Network { .. })
  }

  /// Message suitable for showing to a human.
  ///
  /// Validation messages pass through verbatim. Fatal errors are reduced to a
  /// generic message; their detail belongs in the log only.
  pub fn user_message(&self) -> String {
    match self {
      Self::Timeout { .. } => "The server took too long to respond. Please try again.".to_string(),
      Self::Network { .. } => "Could not reach the server. Check your connection.".to_string(),
      Self::Conflict { .. } => {
        "This record was changed elsewhere. Refresh and retry manually.".to_string()
      }
      Self::Validation { message } => message.clone(),
      Self::Fatal { .. } => "Something went wrong. The change was not saved.".to_string(),
    }
  }
}

impl From<TimeoutError> for SyncError {
  fn from(err: TimeoutError) -> Self {
    Self::Timeout {
      message: err.message,
    }
  }
}

/// Terminal failure of a submitted mutation.
///
/// By the time a caller sees this, the optimistic patch has already been
/// reverted.
#[derive(Debug, Clone, Error)]
#[error("mutation {mutation_id} {status:?} after {attempts} attempt(s): {source}")]
pub struct MutationFailure {
  pub mutation_id: MutationId,
  /// Either `RolledBack` (permanent error) or `Failed` (retries exhausted)
  pub status: MutationStatus,
  pub attempts: u32,
  #[source]
  pub source: SyncError,
}

impl MutationFailure {
  pub fn kind(&self) -> ErrorKind {
    self.source.kind()
  }

  pub fn user_message(&self) -> String {
    self.source.user_message()
  }
}
