//! Mutation request, lifecycle and outcome types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::cache::Payload;
use crate::error::SyncError;
use crate::undo::UndoHandle;

/// Unique id of one submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for MutationId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }

  /// Destructive mutations get an undo token when they commit.
  pub fn is_destructive(&self) -> bool {
    matches!(self, Self::Delete)
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Lifecycle of a pending mutation.
///
/// ```text
/// Applying -> Committed | Retrying | RolledBack
/// Retrying -> Applying | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
  Applying,
  Retrying,
  Committed,
  RolledBack,
  Failed,
}

impl MutationStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
  }

  pub fn can_transition_to(&self, next: MutationStatus) -> bool {
    use MutationStatus::*;
    matches!(
      (self, next),
      (Applying, Committed) | (Applying, Retrying) | (Applying, RolledBack) | (Retrying, Applying) | (Retrying, Failed)
    )
  }
}

/// What to change, on which entity, in which domain.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
  pub domain: String,
  pub entity_type: String,
  /// For creates this is the client-side provisional id
  pub entity_id: String,
  pub kind: MutationKind,
  pub payload: Value,
  pub actor_id: String,
}

impl MutationRequest {
  /// Entity type defaults to the domain name and the actor to "system".
  pub fn new(
    domain: impl Into<String>,
    kind: MutationKind,
    entity_id: impl Into<String>,
    payload: Value,
  ) -> Self {
    let domain = domain.into();
    Self {
      entity_type: domain.clone(),
      domain,
      entity_id: entity_id.into(),
      kind,
      payload,
      actor_id: "system".to_string(),
    }
  }

  pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
    self.entity_type = entity_type.into();
    self
  }

  pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
    self.actor_id = actor_id.into();
    self
  }

  pub(crate) fn describe(&self) -> String {
    format!("{} {} {}", self.kind, self.entity_type, self.entity_id)
  }
}

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
  /// Deadline for each remote attempt
  pub timeout: Option<Duration>,
  /// Undo window for destructive mutations
  pub undo_window: Option<Duration>,
  pub pending_message: Option<String>,
  pub success_message: Option<String>,
  pub undo_message: Option<String>,
}

impl SubmitOptions {
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn undo_window(mut self, window: Duration) -> Self {
    self.undo_window = Some(window);
    self
  }

  pub fn pending_message(mut self, message: impl Into<String>) -> Self {
    self.pending_message = Some(message.into());
    self
  }

  pub fn success_message(mut self, message: impl Into<String>) -> Self {
    self.success_message = Some(message.into());
    self
  }

  pub fn undo_message(mut self, message: impl Into<String>) -> Self {
    self.undo_message = Some(message.into());
    self
  }
}

/// One write attempt in flight. Owned by the coordinator until terminal.
#[derive(Debug, Clone)]
pub struct PendingMutation {
  pub id: MutationId,
  pub domain: String,
  pub entity_type: String,
  pub entity_id: String,
  pub kind: MutationKind,
  pub payload: Value,
  pub snapshot_before_apply: Option<Payload>,
  pub status: MutationStatus,
  pub retry_count: u32,
  pub last_error: Option<SyncError>,
}

impl PendingMutation {
  pub(crate) fn new(id: MutationId, request: &MutationRequest, snapshot: Option<Payload>) -> Self {
    Self {
      id,
      domain: request.domain.clone(),
      entity_type: request.entity_type.clone(),
      entity_id: request.entity_id.clone(),
      kind: request.kind,
      payload: request.payload.clone(),
      snapshot_before_apply: snapshot,
      status: MutationStatus::Applying,
      retry_count: 0,
      last_error: None,
    }
  }

  /// Move to `next` if the state machine allows it.
  pub(crate) fn transition(&mut self, next: MutationStatus) -> bool {
    if !self.status.can_transition_to(next) {
      tracing::warn!(mutation_id = %self.id, from = ?self.status, to = ?next, "illegal status transition ignored");
      return false;
    }
    tracing::debug!(mutation_id = %self.id, from = ?self.status, to = ?next, "status transition");
    self.status = next;
    true
  }
}

/// A committed mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
  pub mutation_id: MutationId,
  pub status: MutationStatus,
  /// Remote attempts made, including the successful one
  pub attempts: u32,
  pub server_result: Option<Value>,
  /// `None` if the audit write failed; the commit stands either way
  pub audit_record: Option<AuditRecord>,
  pub undo: Option<UndoHandle>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_state_machine() {
    use MutationStatus::*;
    assert!(Applying.can_transition_to(Committed));
    assert!(Applying.can_transition_to(Retrying));
    assert!(Applying.can_transition_to(RolledBack));
    assert!(Retrying.can_transition_to(Applying));
    assert!(Retrying.can_transition_to(Failed));

    assert!(!Applying.can_transition_to(Failed));
    assert!(!Retrying.can_transition_to(Committed));
    for terminal in [Committed, RolledBack, Failed] {
      assert!(terminal.is_terminal());
      for next in [Applying, Retrying, Committed, RolledBack, Failed] {
        assert!(!terminal.can_transition_to(next));
      }
    }
  }

  #[test]
  fn test_illegal_transition_is_ignored() {
    let request = MutationRequest::new("tasks", MutationKind::Update, "t1", json!({}));
    let mut pending = PendingMutation::new(MutationId::new(), &request, None);

    assert!(pending.transition(MutationStatus::Committed));
    assert!(!pending.transition(MutationStatus::Applying));
    assert_eq!(pending.status, MutationStatus::Committed);
  }

  #[test]
  fn test_request_defaults() {
    let request = MutationRequest::new("crm", MutationKind::Delete, "c1", json!({"id": "c1"}));
    assert_eq!(request.entity_type, "crm");
    assert_eq!(request.actor_id, "system");

    let request = request.entity_type("contact").actor("alice");
    assert_eq!(request.describe(), "delete contact c1");
    assert_eq!(request.actor_id, "alice");
  }

  #[test]
  fn test_only_delete_is_destructive() {
    assert!(MutationKind::Delete.is_destructive());
    assert!(!MutationKind::Update.is_destructive());
    assert!(!MutationKind::Create.is_destructive());
  }
}
