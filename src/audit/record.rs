//! Audit record types and query filter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mutation::MutationKind;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
  Create,
  Update,
  Delete,
  Restore,
}

impl AuditAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
      Self::Restore => "restore",
    }
  }
}

impl fmt::Display for AuditAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for AuditAction {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      "restore" => Ok(Self::Restore),
      other => Err(eyre!("Unknown audit action '{}'", other)),
    }
  }
}

impl From<MutationKind> for AuditAction {
  fn from(kind: MutationKind) -> Self {
    match kind {
      MutationKind::Create => Self::Create,
      MutationKind::Update => Self::Update,
      MutationKind::Delete => Self::Delete,
    }
  }
}

/// A committed state change, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
  pub entity_type: String,
  pub entity_id: String,
  pub action: AuditAction,
  pub old_value: Option<Value>,
  pub new_value: Option<Value>,
  pub actor_id: String,
  pub recorded_at: DateTime<Utc>,
}

/// Immutable, stored audit record. `id` is assigned by the store and grows with insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
  pub id: u64,
  pub entity_type: String,
  pub entity_id: String,
  pub action: AuditAction,
  pub old_value: Option<Value>,
  pub new_value: Option<Value>,
  pub actor_id: String,
  pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
  pub fn from_entry(id: u64, entry: AuditEntry) -> Self {
    Self {
      id,
      entity_type: entry.entity_type,
      entity_id: entry.entity_id,
      action: entry.action,
      old_value: entry.old_value,
      new_value: entry.new_value,
      actor_id: entry.actor_id,
      recorded_at: entry.recorded_at,
    }
  }
}

/// Filter for audit queries. Unset fields match everything; bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
  pub entity_type: Option<String>,
  pub entity_id: Option<String>,
  pub action: Option<AuditAction>,
  pub since: Option<DateTime<Utc>>,
  pub until: Option<DateTime<Utc>>,
  pub limit: Option<usize>,
}

impl AuditFilter {
  pub fn new() -> Self {
    Self::default()
  }

  /// All records for one entity, the usual "history panel" query.
  pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
    Self::new()
      .entity_type(entity_type)
      .entity_id(entity_id)
  }

  pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
    self.entity_type = Some(entity_type.into());
    self
  }

  pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
    self.entity_id = Some(entity_id.into());
    self
  }

  pub fn action(mut self, action: AuditAction) -> Self {
    self.action = Some(action);
    self
  }

  pub fn since(mut self, since: DateTime<Utc>) -> Self {
    self.since = Some(since);
    self
  }

  pub fn until(mut self, until: DateTime<Utc>) -> Self {
    self.until = Some(until);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, record: &AuditRecord) -> bool {
    self
      .entity_type
      .as_ref()
      .map_or(true, |t| *t == record.entity_type)
      && self
        .entity_id
        .as_ref()
        .map_or(true, |id| *id == record.entity_id)
      && self.action.map_or(true, |a| a == record.action)
      && self.since.map_or(true, |s| record.recorded_at >= s)
      && self.until.map_or(true, |u| record.recorded_at <= u)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn record(action: AuditAction, at: DateTime<Utc>) -> AuditRecord {
    AuditRecord {
      id: 1,
      entity_type: "task".into(),
      entity_id: "t1".into(),
      action,
      old_value: None,
      new_value: None,
      actor_id: "alice".into(),
      recorded_at: at,
    }
  }

  #[test]
  fn test_action_parse_roundtrip() {
    for action in [
      AuditAction::Create,
      AuditAction::Update,
      AuditAction::Delete,
      AuditAction::Restore,
    ] {
      assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
    }
    assert!("purge".parse::<AuditAction>().is_err());
  }

  #[test]
  fn test_empty_filter_matches_all() {
    assert!(AuditFilter::new().matches(&record(AuditAction::Delete, Utc::now())));
  }

  #[test]
  fn test_filter_fields() {
    let now = Utc::now();
    let rec = record(AuditAction::Update, now);

    assert!(AuditFilter::for_entity("task", "t1").matches(&rec));
    assert!(!AuditFilter::for_entity("task", "t2").matches(&rec));
    assert!(!AuditFilter::new().entity_type("deal").matches(&rec));
    assert!(!AuditFilter::new()
      .action(AuditAction::Restore)
      .matches(&rec));
    assert!(AuditFilter::new()
      .since(now - Duration::seconds(1))
      .until(now)
      .matches(&rec));
    assert!(!AuditFilter::new()
      .since(now + Duration::seconds(1))
      .matches(&rec));
  }
}
