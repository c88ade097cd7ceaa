//! Deadline wrapper for remote calls.
//!
//! The deadline timer lives inside the returned future and is dropped with it,
//! so it is gone on every exit path: success, failure of the operation, or the
//! deadline firing. When the deadline wins, the operation future is dropped as
//! well and its eventual result is never observed.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The deadline elapsed before the operation completed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TimeoutError {
  pub message: String,
}

/// Run `operation`, failing with `message` if it has not completed within `timeout`.
///
/// Errors produced by the operation itself pass through unchanged. There are no
/// retries here; retry policy belongs to the caller.
pub async fn run_with_timeout<F, T, E>(
  operation: F,
  timeout: Duration,
  message: impl Into<String>,
) -> Result<T, E>
where
  F: Future<Output = Result<T, E>>,
  E: From<TimeoutError>,
{
  match tokio::time::timeout(timeout, operation).await {
    Ok(result) => result,
    Err(_elapsed) => {
      let message = message.into();
      tracing::debug!(timeout_ms = timeout.as_millis() as u64, %message, "deadline exceeded");
      Err(TimeoutError { message }.into())
    }
  }
}
