//! Short-lived undo tokens for destructive mutations.
//!
//! A token is consumable exactly once, and only before it expires. Expired and
//! consumed tokens are purged lazily on every registry access, so no timer is
//! ever left running on their behalf.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::mutation::MutationId;

/// Reverses a committed destructive mutation. Resolves to the re-created entity, if the server returned one.
pub type RestoreAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<Option<Value>, SyncError>> + Send>;

struct UndoToken {
  expires_at: Instant,
  restore: Option<RestoreAction>,
  consumed: bool,
}

impl UndoToken {
  fn is_live(&self, now: Instant) -> bool {
    !self.consumed && now < self.expires_at
  }
}

/// What the caller needs to offer an undo affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoHandle {
  pub mutation_id: MutationId,
  pub expires_at: Instant,
}

impl UndoHandle {
  pub fn remaining(&self) -> Duration {
    self.expires_at.saturating_duration_since(Instant::now())
  }
}

/// Result of trying to consume an undo token.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoOutcome {
  /// The restore action ran and succeeded
  Restored { entity: Option<Value> },
  /// Already consumed, expired, or never registered
  AlreadyHandled,
  /// The restore action ran and failed; the token is spent regardless
  RestoreFailed(SyncError),
}

#[derive(Default)]
pub struct UndoRegistry {
  tokens: Mutex<HashMap<MutationId, UndoToken>>,
}

impl UndoRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn tokens(&self) -> MutexGuard<'_, HashMap<MutationId, UndoToken>> {
    let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
    let now = Instant::now();
    tokens.retain(|_, token| token.is_live(now));
    tokens
  }

  /// Register a restore action for `mutation_id`, valid for `ttl`.
  pub fn register<F, Fut>(&self, mutation_id: MutationId, restore: F, ttl: Duration) -> UndoHandle
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Value>, SyncError>> + Send + 'static,
  {
    let expires_at = Instant::now() + ttl;
    let action: RestoreAction = Box::new(move || restore().boxed());

    let previous = self.tokens().insert(
      mutation_id,
      UndoToken {
        expires_at,
        restore: Some(action),
        consumed: false,
      },
    );
    if previous.is_some() {
      warn!(%mutation_id, "replaced existing undo token");
    }
    debug!(%mutation_id, ttl_ms = ttl.as_millis() as u64, "undo token registered");

    UndoHandle {
      mutation_id,
      expires_at,
    }
  }

  /// Consume the token and run its restore action. Exactly once.
  pub async fn consume(&self, mutation_id: MutationId) -> UndoOutcome {
    let action = {
      let mut tokens = self.tokens();
      match tokens.get_mut(&mutation_id) {
        Some(token) => {
          token.consumed = true;
          token.restore.take()
        }
        None => None,
      }
    };

    let Some(action) = action else {
      debug!(%mutation_id, "undo already handled or expired");
      return UndoOutcome::AlreadyHandled;
    };

    match action().await {
      Ok(entity) => {
        info!(%mutation_id, "undo restored");
        UndoOutcome::Restored { entity }
      }
      Err(e) => {
        warn!(%mutation_id, error = %e, "undo restore failed");
        UndoOutcome::RestoreFailed(e)
      }
    }
  }

  /// Whether a live token exists for `mutation_id`.
  pub fn is_pending(&self, mutation_id: MutationId) -> bool {
    self.tokens().contains_key(&mutation_id)
  }

  /// Number of live tokens.
  pub fn len(&self) -> usize {
    self.tokens().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
