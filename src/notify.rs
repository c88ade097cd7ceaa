//! Notification sink for surfacing mutation lifecycle to a human.

use tracing::{error, info, warn};

use crate::undo::UndoHandle;

/// Receives lifecycle messages: pending while applying or retrying, then
/// success or error on the terminal state, plus an undo offer for destructive
/// mutations.
pub trait Notifier: Send + Sync {
  fn notify_pending(&self, message: &str);
  fn notify_success(&self, message: &str);
  fn notify_error(&self, message: &str);
  /// Offer an undo. The caller consumes it with the handle's mutation id before it expires.
  fn notify_undoable(&self, message: &str, undo: UndoHandle);
}

/// Sends notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn notify_pending(&self, message: &str) {
    info!(target: "optisync::notify", "{}", message);
  }

  fn notify_success(&self, message: &str) {
    info!(target: "optisync::notify", "{}", message);
  }

  fn notify_error(&self, message: &str) {
    warn!(target: "optisync::notify", "{}", message);
  }

  fn notify_undoable(&self, message: &str, undo: UndoHandle) {
    info!(
      target: "optisync::notify",
      mutation_id = %undo.mutation_id,
      remaining_ms = undo.remaining().as_millis() as u64,
      "{}",
      message
    );
  }
}

/// Drops notifications; errors still go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
  fn notify_pending(&self, _message: &str) {}
  fn notify_success(&self, _message: &str) {}
  fn notify_error(&self, message: &str) {
    error!(target: "optisync::notify", "{}", message);
  }
  fn notify_undoable(&self, _message: &str, _undo: UndoHandle) {}
}
