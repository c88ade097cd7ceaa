use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::RemoteStore;
use crate::cache::Payload;
use crate::error::SyncError;
use crate::mutation::MutationKind;
use crate::records::{self, record_id};

/// In-process remote store.
///
/// Behaves like a small authoritative backend: creates get a server-assigned
/// id, updates shallow-merge, deletes remove. Latency and failures can be
/// injected so callers can exercise retries, rollbacks and timeouts.
pub struct MemoryRemote {
  id_field: String,
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  domains: HashMap<String, Payload>,
  next_id: u64,
  fetch_delay: Duration,
  write_delay: Duration,
  fetch_failures: VecDeque<SyncError>,
  write_failures: VecDeque<SyncError>,
  fetch_counts: HashMap<String, u32>,
  write_log: Vec<(String, MutationKind, Value)>,
}

impl Default for MemoryRemote {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self {
      id_field: "id".to_string(),
      state: Mutex::new(MemoryState {
        next_id: 1,
        ..MemoryState::default()
      }),
    }
  }

  pub fn with_id_field(mut self, id_field: &str) -> Self {
    self.id_field = id_field.to_string();
    self
  }

  fn state(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Replace a domain's records.
  pub fn seed(&self, domain: &str, records: Payload) {
    self.state().domains.insert(domain.to_string(), records);
  }

  pub fn records(&self, domain: &str) -> Payload {
    self.state().domains.get(domain).cloned().unwrap_or_default()
  }

  pub fn set_fetch_delay(&self, delay: Duration) {
    self.state().fetch_delay = delay;
  }

  pub fn set_write_delay(&self, delay: Duration) {
    self.state().write_delay = delay;
  }

  /// Queue errors returned by the next fetches, one per call.
  pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = SyncError>) {
    self.state().fetch_failures.extend(errors);
  }

  /// Queue errors returned by the next writes, one per call.
  pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = SyncError>) {
    self.state().write_failures.extend(errors);
  }

  pub fn fetch_count(&self, domain: &str) -> u32 {
    self.state().fetch_counts.get(domain).copied().unwrap_or(0)
  }

  /// Number of write attempts, failed ones included.
  pub fn write_count(&self) -> usize {
    self.state().write_log.len()
  }

  pub fn writes(&self) -> Vec<(String, MutationKind, Value)> {
    self.state().write_log.clone()
  }

  fn apply_write(
    &self,
    state: &mut MemoryState,
    domain: &str,
    kind: MutationKind,
    payload: &Value,
  ) -> Result<Option<Value>, SyncError> {
    let id_field = self.id_field.as_str();

    match kind {
      MutationKind::Create => {
        let mut record = payload.clone();
        let Some(fields) = record.as_object_mut() else {
          return Err(SyncError::validation("Record must be a JSON object"));
        };
        let id = format!("{}-{}", domain, state.next_id);
        state.next_id += 1;
        fields.insert(id_field.to_string(), Value::String(id));

        let records = state.domains.entry(domain.to_string()).or_default();
        records.push(record.clone());
        Ok(Some(record))
      }
      MutationKind::Update => {
        let id = record_id(payload, id_field)
          .ok_or_else(|| SyncError::validation(format!("Payload has no '{}' field", id_field)))?;
        let records = state.domains.entry(domain.to_string()).or_default();
        if records::position(records, id_field, &id).is_none() {
          return Err(SyncError::conflict(format!("{} {} no longer exists", domain, id)));
        }
        *records = records::merge(records, id_field, &id, payload);
        Ok(records::find(records, id_field, &id).cloned())
      }
      MutationKind::Delete => {
        let id = record_id(payload, id_field)
          .ok_or_else(|| SyncError::validation(format!("Payload has no '{}' field", id_field)))?;
        let records = state.domains.entry(domain.to_string()).or_default();
        if records::position(records, id_field, &id).is_none() {
          return Err(SyncError::conflict(format!("{} {} no longer exists", domain, id)));
        }
        *records = records::remove(records, id_field, &id);
        Ok(None)
      }
    }
  }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
  async fn fetch_domain(&self, domain: &str) -> Result<Payload, SyncError> {
    let delay = {
      let mut state = self.state();
      *state.fetch_counts.entry(domain.to_string()).or_default() += 1;
      state.fetch_delay
    };

    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let mut state = self.state();
    if let Some(err) = state.fetch_failures.pop_front() {
      return Err(err);
    }
    Ok(state.domains.get(domain).cloned().unwrap_or_default())
  }

  async fn write_entity(
    &self,
    domain: &str,
    kind: MutationKind,
    payload: &Value,
  ) -> Result<Option<Value>, SyncError> {
    let delay = {
      let mut state = self.state();
      state
        .write_log
        .push((domain.to_string(), kind, payload.clone()));
      state.write_delay
    };

    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let mut state = self.state();
    if let Some(err) = state.write_failures.pop_front() {
      return Err(err);
    }
    self.apply_write(&mut state, domain, kind, payload)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_create_assigns_server_id() {
    let remote = MemoryRemote::new();
    let created = remote
      .write_entity("crm", MutationKind::Create, &json!({"id": "tmp", "name": "Acme"}))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(created["id"], "crm-1");
    assert_eq!(remote.records("crm").len(), 1);
  }

  #[tokio::test]
  async fn test_custom_id_field() {
    let remote = MemoryRemote::new().with_id_field("uuid");
    remote.seed("crm", vec![json!({"uuid": "c1", "name": "Acme"})]);

    let created = remote
      .write_entity("crm", MutationKind::Create, &json!({"name": "Globex"}))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(created["uuid"], "crm-1");
    assert!(created.get("id").is_none());

    remote
      .write_entity("crm", MutationKind::Update, &json!({"uuid": "c1", "name": "Acme Corp"}))
      .await
      .unwrap();
    assert_eq!(remote.records("crm")[0]["name"], "Acme Corp");
  }

  #[tokio::test]
  async fn test_update_missing_record_conflicts() {
    let remote = MemoryRemote::new();
    let err = remote
      .write_entity("tasks", MutationKind::Update, &json!({"id": "t1", "status": "done"}))
      .await
      .unwrap_err();

    assert!(matches!(err, SyncError::Conflict { .. }));
  }

  #[tokio::test]
  async fn test_injected_failures_are_consumed_in_order() {
    let remote = MemoryRemote::new();
    remote.seed("tasks", vec![json!({"id": "t1"})]);
    remote.fail_next_fetches([SyncError::network("reset")]);

    assert!(remote.fetch_domain("tasks").await.is_err());
    assert_eq!(remote.fetch_domain("tasks").await.unwrap().len(), 1);
    assert_eq!(remote.fetch_count("tasks"), 2);
  }
}
