//! Mutation coordinator: optimistic apply, bounded retry, then commit or rollback.
//!
//! The coordinator owns all optimistic-update policy. The cache only provides
//! apply/revert primitives; the coordinator decides when each one happens.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::types::{
  MutationId, MutationKind, MutationOutcome, MutationRequest, MutationStatus, PendingMutation,
  SubmitOptions,
};
use crate::audit::{AuditAction, AuditEntry, AuditLogRecorder};
use crate::cache::{CachePartitionManager, Payload};
use crate::error::{ErrorKind, MutationFailure, SyncError};
use crate::notify::Notifier;
use crate::records::{self, record_id};
use crate::remote::RemoteStore;
use crate::timeout::run_with_timeout;
use crate::undo::UndoRegistry;

/// Tuning for remote writes and undo.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
  /// Deadline for each remote write attempt
  pub write_timeout: Duration,
  pub retry: RetryPolicy,
  /// How long a destructive mutation stays undoable
  pub undo_window: Duration,
  /// Field identifying a record inside a domain payload
  pub id_field: String,
}

impl Default for CoordinatorSettings {
  fn default() -> Self {
    Self {
      write_timeout: Duration::from_secs(10),
      retry: RetryPolicy::default(),
      undo_window: Duration::from_secs(5),
      id_field: "id".to_string(),
    }
  }
}

type EntityKey = (String, String);
type EntityLocks = Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive right to mutate one entity. The lock map entry goes away with the last holder.
struct EntityLease<'a> {
  key: EntityKey,
  guard: Option<OwnedMutexGuard<()>>,
  locks: &'a EntityLocks,
}

impl Drop for EntityLease<'_> {
  fn drop(&mut self) {
    self.guard.take();
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    if locks
      .get(&self.key)
      .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
      locks.remove(&self.key);
    }
  }
}

/// Undoes an applied optimistic patch if `submit` is dropped before it settles.
struct AppliedPatch<'a> {
  coordinator: &'a MutationCoordinator,
  mutation_id: MutationId,
  request: &'a MutationRequest,
  snapshot: Option<Payload>,
  armed: bool,
}

impl AppliedPatch<'_> {
  /// The remote call settled; commit or rollback takes over. Hands back the snapshot.
  fn disarm(mut self) -> Option<Payload> {
    self.armed = false;
    self.snapshot.take()
  }
}

impl Drop for AppliedPatch<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    warn!(
      mutation_id = %self.mutation_id,
      mutation = %self.request.describe(),
      "mutation abandoned before it settled, reverting"
    );
    self
      .coordinator
      .revert_entity(self.request, self.snapshot.as_deref());
    self.coordinator.pending_map().remove(&self.mutation_id);
  }
}

/// Central orchestrator for writes.
///
/// Mutations on the same entity are serialized in submission order: a second
/// mutation waits for the first to reach a terminal state before applying its
/// own optimistic patch. Mutations on different entities run concurrently.
pub struct MutationCoordinator {
  cache: Arc<CachePartitionManager>,
  remote: Arc<dyn RemoteStore>,
  audit: AuditLogRecorder,
  undo: Arc<UndoRegistry>,
  notifier: Arc<dyn Notifier>,
  settings: CoordinatorSettings,
  pending: Mutex<HashMap<MutationId, PendingMutation>>,
  entity_locks: EntityLocks,
}

impl MutationCoordinator {
  pub fn new(
    cache: Arc<CachePartitionManager>,
    remote: Arc<dyn RemoteStore>,
    audit: AuditLogRecorder,
    undo: Arc<UndoRegistry>,
    notifier: Arc<dyn Notifier>,
    settings: CoordinatorSettings,
  ) -> Self {
    Self {
      cache,
      remote,
      audit,
      undo,
      notifier,
      settings,
      pending: Mutex::new(HashMap::new()),
      entity_locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn settings(&self) -> &CoordinatorSettings {
    &self.settings
  }

  pub fn undo(&self) -> &Arc<UndoRegistry> {
    &self.undo
  }

  /// Mutations that have not reached a terminal state yet.
  pub fn pending(&self) -> Vec<PendingMutation> {
    self.pending_map().values().cloned().collect()
  }

  /// Submit a mutation whose remote write goes through the configured [`RemoteStore`].
  pub async fn submit_remote<A>(
    &self,
    request: MutationRequest,
    apply: A,
    options: SubmitOptions,
  ) -> Result<MutationOutcome, MutationFailure>
  where
    A: FnOnce(&Payload) -> Payload,
  {
    let remote = Arc::clone(&self.remote);
    let domain = request.domain.clone();
    let kind = request.kind;
    let payload = request.payload.clone();

    let remote_call = move || {
      let remote = Arc::clone(&remote);
      let domain = domain.clone();
      let payload = payload.clone();
      async move { remote.write_entity(&domain, kind, &payload).await }
    };

    self.submit(request, apply, remote_call, options).await
  }

  /// Apply `apply` optimistically, then run `remote_call` until it commits or fails for good.
  ///
  /// 1. Wait for any earlier mutation on the same entity to finish
  /// 2. Snapshot the domain payload and apply the optimistic patch
  /// 3. Call the remote under a deadline, retrying transient failures with backoff
  /// 4. Commit: reconcile, invalidate, audit, and register undo for deletes
  /// 5. Or roll back: restore the entity from the snapshot and report the failure
  ///
  /// `remote_call` is invoked once per attempt. Dropping the returned future
  /// before the remote call settles reverts the patch as a rollback would.
  pub async fn submit<A, R, Fut>(
    &self,
    request: MutationRequest,
    apply: A,
    remote_call: R,
    options: SubmitOptions,
  ) -> Result<MutationOutcome, MutationFailure>
  where
    A: FnOnce(&Payload) -> Payload,
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Value>, SyncError>>,
  {
    let mutation_id = MutationId::new();
    let _lease = self.lease_entity(&request).await;
    debug!(%mutation_id, mutation = %request.describe(), "entity lease acquired");

    let snapshot = self.cache.snapshot(&request.domain);
    self.pending_map().insert(
      mutation_id,
      PendingMutation::new(mutation_id, &request, snapshot.clone()),
    );

    self.cache.apply_optimistic_patch(&request.domain, apply);
    let pending_message = options
      .pending_message
      .clone()
      .unwrap_or_else(|| format!("Saving {}", request.describe()));
    self.notifier.notify_pending(&pending_message);

    let applied = AppliedPatch {
      coordinator: self,
      mutation_id,
      request: &request,
      snapshot,
      armed: true,
    };
    let result = self
      .call_with_retry(mutation_id, &request, remote_call, &options)
      .await;
    // No await between here and the cache and pending-map updates below
    let snapshot = applied.disarm();

    match result {
      Ok((server_result, attempts)) => Ok(
        self
          .commit(mutation_id, &request, snapshot, server_result, attempts, &options)
          .await,
      ),
      Err((error, attempts)) => Err(self.roll_back(mutation_id, &request, snapshot, error, attempts)),
    }
  }

  async fn lease_entity(&self, request: &MutationRequest) -> EntityLease<'_> {
    let key = (request.domain.clone(), request.entity_id.clone());
    let lock = {
      let mut locks = self
        .entity_locks
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      Arc::clone(locks.entry(key.clone()).or_default())
    };

    // tokio's mutex is fair, so waiters are served in submission order
    let guard = lock.lock_owned().await;
    EntityLease {
      key,
      guard: Some(guard),
      locks: &self.entity_locks,
    }
  }

  /// Explicit bounded retry loop. Returns the server result and the number of attempts made.
  async fn call_with_retry<R, Fut>(
    &self,
    mutation_id: MutationId,
    request: &MutationRequest,
    mut remote_call: R,
    options: &SubmitOptions,
  ) -> Result<(Option<Value>, u32), (SyncError, u32)>
  where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Value>, SyncError>>,
  {
    let policy = &self.settings.retry;
    let timeout = options.timeout.unwrap_or(self.settings.write_timeout);
    let mut retries: u32 = 0;

    loop {
      let attempts = retries + 1;
      let message = format!(
        "{} exceeded {}ms",
        request.describe(),
        timeout.as_millis()
      );

      let error = match run_with_timeout(remote_call(), timeout, message).await {
        Ok(server_result) => return Ok((server_result, attempts)),
        Err(e) => e,
      };

      if !error.is_transient() {
        return Err((error, attempts));
      }

      self.update_pending(mutation_id, |p| {
        p.transition(MutationStatus::Retrying);
        p.last_error = Some(error.clone());
      });

      if !policy.should_retry(request.kind, &error, retries) {
        warn!(%mutation_id, attempts, error = %error, "retries exhausted");
        return Err((error, attempts));
      }

      let delay = policy.delay_for(retries);
      warn!(
        %mutation_id,
        attempt = attempts,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "transient failure, retrying"
      );
      self
        .notifier
        .notify_pending(&format!("Retrying {} (attempt {})", request.describe(), attempts + 1));

      tokio::time::sleep(delay).await;
      retries += 1;

      self.update_pending(mutation_id, |p| {
        p.retry_count = retries;
        p.transition(MutationStatus::Applying);
      });
    }
  }

  async fn commit(
    &self,
    mutation_id: MutationId,
    request: &MutationRequest,
    snapshot: Option<Payload>,
    server_result: Option<Value>,
    attempts: u32,
    options: &SubmitOptions,
  ) -> MutationOutcome {
    let id_field = self.settings.id_field.as_str();
    let domain = request.domain.as_str();

    match (&server_result, request.kind) {
      (Some(record), MutationKind::Create | MutationKind::Update) => {
        self.cache.confirm_optimistic_patch(domain, |payload| {
          records::replace(payload, id_field, &request.entity_id, record.clone())
        })
      }
      _ => self.cache.confirm_optimistic_patch(domain, Payload::clone),
    }
    self.cache.invalidate(domain);

    self.update_pending(mutation_id, |p| {
      p.transition(MutationStatus::Committed);
    });
    self.pending_map().remove(&mutation_id);
    info!(%mutation_id, mutation = %request.describe(), attempts, "mutation committed");

    let old_value = snapshot
      .as_deref()
      .and_then(|s| records::find(s, id_field, &request.entity_id))
      .cloned();
    let entity_id = server_result
      .as_ref()
      .and_then(|r| record_id(r, id_field))
      .unwrap_or_else(|| request.entity_id.clone());
    let new_value = match request.kind {
      MutationKind::Delete => None,
      _ => server_result
        .clone()
        .or_else(|| Some(request.payload.clone())),
    };

    let audit_record = self
      .audit
      .record(AuditEntry {
        entity_type: request.entity_type.clone(),
        entity_id,
        action: request.kind.into(),
        old_value: old_value.clone(),
        new_value,
        actor_id: request.actor_id.clone(),
        recorded_at: Utc::now(),
      })
      .await;

    let success_message = options
      .success_message
      .clone()
      .unwrap_or_else(|| format!("Saved {}", request.describe()));
    self.notifier.notify_success(&success_message);

    let undo = if request.kind.is_destructive() {
      let deleted = old_value.unwrap_or_else(|| request.payload.clone());
      let window = options.undo_window.unwrap_or(self.settings.undo_window);
      let handle = self
        .undo
        .register(mutation_id, self.restore_action(request, deleted), window);

      let undo_message = options.undo_message.clone().unwrap_or_else(|| {
        format!("Deleted {} {}", request.entity_type, request.entity_id)
      });
      self.notifier.notify_undoable(&undo_message, handle);
      Some(handle)
    } else {
      None
    };

    MutationOutcome {
      mutation_id,
      status: MutationStatus::Committed,
      attempts,
      server_result,
      audit_record,
      undo,
    }
  }

  /// Reverse a committed delete by creating the record again (under a new id).
  fn restore_action(
    &self,
    request: &MutationRequest,
    deleted: Value,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Option<Value>, SyncError>> + Send + 'static {
    let remote = Arc::clone(&self.remote);
    let cache = Arc::clone(&self.cache);
    let audit = self.audit.clone();
    let notifier = Arc::clone(&self.notifier);
    let domain = request.domain.clone();
    let entity_type = request.entity_type.clone();
    let original_id = request.entity_id.clone();
    let actor_id = request.actor_id.clone();
    let id_field = self.settings.id_field.clone();
    let timeout = self.settings.write_timeout;

    move || {
      async move {
        let mut record = deleted;
        if let Some(fields) = record.as_object_mut() {
          fields.remove(&id_field);
        }

        let message = format!(
          "restoring {} {} exceeded {}ms",
          entity_type,
          original_id,
          timeout.as_millis()
        );
        let created = run_with_timeout(
          remote.write_entity(&domain, MutationKind::Create, &record),
          timeout,
          message,
        )
        .await?;
        cache.invalidate(&domain);

        let entity_id = created
          .as_ref()
          .and_then(|r| record_id(r, &id_field))
          .unwrap_or(original_id);
        audit
          .record(AuditEntry {
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
            action: AuditAction::Restore,
            old_value: None,
            new_value: Some(created.clone().unwrap_or(record)),
            actor_id,
            recorded_at: Utc::now(),
          })
          .await;
        notifier.notify_success(&format!("Restored {} {}", entity_type, entity_id));

        Ok::<_, SyncError>(created)
      }
      .boxed()
    }
  }

  fn roll_back(
    &self,
    mutation_id: MutationId,
    request: &MutationRequest,
    snapshot: Option<Payload>,
    error: SyncError,
    attempts: u32,
  ) -> MutationFailure {
    self.revert_entity(request, snapshot.as_deref());

    let status = {
      let mut pending = self.pending_map();
      let status = match pending.get_mut(&mutation_id) {
        Some(p) => {
          let next = if p.status == MutationStatus::Retrying {
            MutationStatus::Failed
          } else {
            MutationStatus::RolledBack
          };
          p.transition(next);
          p.last_error = Some(error.clone());
          p.status
        }
        None => MutationStatus::RolledBack,
      };
      pending.remove(&mutation_id);
      status
    };

    if error.kind() == ErrorKind::Fatal {
      error!(%mutation_id, mutation = %request.describe(), detail = %error, "mutation failed unexpectedly");
    } else {
      info!(%mutation_id, mutation = %request.describe(), ?status, error = %error, "mutation rolled back");
    }
    self.notifier.notify_error(&error.user_message());

    MutationFailure {
      mutation_id,
      status,
      attempts,
      source: error,
    }
  }

  /// Put one entity back to its pre-apply state, leaving the rest of the domain as it is now.
  ///
  /// Patches from other mutations and fetches that landed since the snapshot
  /// survive; the domain is left stale so the next read refetches.
  fn revert_entity(&self, request: &MutationRequest, snapshot: Option<&[Value]>) {
    let id_field = self.settings.id_field.as_str();
    self.cache.revert_with(&request.domain, |current| {
      let current = current?;
      let restored = records::restore_entity(
        current,
        snapshot.unwrap_or_default(),
        id_field,
        &request.entity_id,
      );
      // Never fetched before the patch: nothing to show
      if snapshot.is_none() && restored.is_empty() {
        None
      } else {
        Some(restored)
      }
    });
  }

  fn pending_map(&self) -> MutexGuard<'_, HashMap<MutationId, PendingMutation>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn update_pending(&self, mutation_id: MutationId, f: impl FnOnce(&mut PendingMutation)) {
    if let Some(pending) = self.pending_map().get_mut(&mutation_id) {
      f(pending);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::audit::{AuditFilter, MemoryAuditStore};
  use crate::cache::{CacheSettings, CacheSource};
  use crate::remote::MemoryRemote;
  use crate::undo::{UndoHandle, UndoOutcome};
  use serde_json::json;
  use tokio::time::Instant;

  #[derive(Default)]
  struct RecordingNotifier {
    events: Mutex<Vec<(&'static str, String)>>,
  }

  impl RecordingNotifier {
    fn events(&self) -> Vec<(&'static str, String)> {
      self.events.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<&'static str> {
      self.events().into_iter().map(|(k, _)| k).collect()
    }
  }

  impl Notifier for RecordingNotifier {
    fn notify_pending(&self, message: &str) {
      self.events.lock().unwrap().push(("pending", message.to_string()));
    }

    fn notify_success(&self, message: &str) {
      self.events.lock().unwrap().push(("success", message.to_string()));
    }

    fn notify_error(&self, message: &str) {
      self.events.lock().unwrap().push(("error", message.to_string()));
    }

    fn notify_undoable(&self, message: &str, _undo: UndoHandle) {
      self.events.lock().unwrap().push(("undoable", message.to_string()));
    }
  }

  struct Harness {
    remote: Arc<MemoryRemote>,
    cache: Arc<CachePartitionManager>,
    audit: AuditLogRecorder,
    notifier: Arc<RecordingNotifier>,
    coordinator: Arc<MutationCoordinator>,
  }

  async fn harness() -> Harness {
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(
      "tasks",
      vec![
        json!({"id": "t1", "title": "Write docs", "status": "todo"}),
        json!({"id": "t2", "title": "Fix bug", "status": "doing"}),
      ],
    );

    let cache = Arc::new(CachePartitionManager::new(
      remote.clone(),
      CacheSettings::default(),
    ));
    cache.get("tasks").await.unwrap();

    let audit = AuditLogRecorder::new(Arc::new(MemoryAuditStore::new()), Duration::from_secs(2));
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = Arc::new(MutationCoordinator::new(
      cache.clone(),
      remote.clone(),
      audit.clone(),
      Arc::new(UndoRegistry::new()),
      notifier.clone(),
      CoordinatorSettings::default(),
    ));

    Harness {
      remote,
      cache,
      audit,
      notifier,
      coordinator,
    }
  }

  fn update(id: &str, patch: Value) -> (MutationRequest, impl FnOnce(&Payload) -> Payload) {
    let mut payload = patch.clone();
    payload["id"] = json!(id);
    let request = MutationRequest::new("tasks", MutationKind::Update, id, payload)
      .entity_type("task")
      .actor("alice");
    let id = id.to_string();
    let apply = move |records: &Payload| records::merge(records, "id", &id, &patch);
    (request, apply)
  }

  fn status_of(cache: &CachePartitionManager, id: &str) -> Value {
    let read = cache.peek("tasks").unwrap();
    records::find(&read.data, "id", id).unwrap()["status"].clone()
  }

  #[tokio::test(start_paused = true)]
  async fn test_commit_invalidates_and_audits() {
    let h = harness().await;
    let (request, apply) = update("t1", json!({"status": "done"}));

    let outcome = h
      .coordinator
      .submit_remote(request, apply, SubmitOptions::default())
      .await
      .unwrap();

    assert_eq!(outcome.status, MutationStatus::Committed);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.undo.is_none());

    let record = outcome.audit_record.unwrap();
    assert_eq!(record.action, AuditAction::Update);
    assert_eq!(record.entity_id, "t1");
    assert_eq!(record.old_value.unwrap()["status"], "todo");
    assert_eq!(record.new_value.unwrap()["status"], "done");

    // Still showing the committed state, but stale until refetched
    let read = h.cache.peek("tasks").unwrap();
    assert!(read.is_stale());
    assert!(!read.provisional);
    assert_eq!(status_of(&h.cache, "t1"), "done");

    h.cache.get("tasks").await.unwrap();
    assert_eq!(h.remote.fetch_count("tasks"), 2);
    assert_eq!(h.notifier.kinds(), vec!["pending", "success"]);
    assert!(h.coordinator.pending().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_state_visible_before_commit() {
    let h = harness().await;
    h.remote.set_write_delay(Duration::from_secs(2));
    let (request, apply) = update("t1", json!({"status": "done"}));

    let coordinator = h.coordinator.clone();
    let task = tokio::spawn(async move {
      coordinator
        .submit_remote(request, apply, SubmitOptions::default())
        .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let read = h.cache.peek("tasks").unwrap();
    assert!(read.provisional);
    assert_eq!(status_of(&h.cache, "t1"), "done");

    let pending = h.coordinator.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MutationStatus::Applying);
    assert_eq!(pending[0].entity_id, "t1");

    task.await.unwrap().unwrap();
    assert!(h.coordinator.pending().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_failure_rolls_back_without_audit() {
    let h = harness().await;
    let before = h.cache.peek("tasks").unwrap().data;
    h.remote
      .fail_next_writes([SyncError::validation("status 'done' requires an assignee")]);
    let (request, apply) = update("t1", json!({"status": "done"}));

    let failure = h
      .coordinator
      .submit_remote(request, apply, SubmitOptions::default())
      .await
      .unwrap_err();

    assert_eq!(failure.status, MutationStatus::RolledBack);
    assert_eq!(failure.kind(), ErrorKind::Validation);
    assert_eq!(failure.attempts, 1);
    assert_eq!(h.remote.write_count(), 1);

    let after = h.cache.peek("tasks").unwrap();
    assert_eq!(after.data, before);
    assert!(!after.provisional);

    assert!(h.audit.query(&AuditFilter::new()).await.unwrap().is_empty());
    assert_eq!(
      h.notifier.events().last().unwrap(),
      &("error", "status 'done' requires an assignee".to_string())
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_then_success() {
    let h = harness().await;
    h.remote
      .fail_next_writes([SyncError::network("reset"), SyncError::network("reset")]);
    let (request, apply) = update("t1", json!({"status": "done"}));

    let start = Instant::now();
    let outcome = h
      .coordinator
      .submit_remote(request, apply, SubmitOptions::default())
      .await
      .unwrap();

    assert_eq!(outcome.attempts, 3);
    assert!(start.elapsed() >= Duration::from_millis(3000));
    assert_eq!(h.audit.query(&AuditFilter::new()).await.unwrap().len(), 1);
    assert_eq!(
      h.notifier.kinds(),
      vec!["pending", "pending", "pending", "success"]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhausted() {
    let h = harness().await;
    let before = h.cache.peek("tasks").unwrap().data;
    h.remote.fail_next_writes([
      SyncError::network("down"),
      SyncError::network("down"),
      SyncError::network("down"),
    ]);
    let (request, apply) = update("t1", json!({"status": "done"}));

    let failure = h
      .coordinator
      .submit_remote(request, apply, SubmitOptions::default())
      .await
      .unwrap_err();

    assert_eq!(failure.status, MutationStatus::Failed);
    assert_eq!(failure.attempts, 3);
    assert_eq!(h.remote.write_count(), 3);
    assert_eq!(h.cache.peek("tasks").unwrap().data, before);
    assert!(h.audit.query(&AuditFilter::new()).await.unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_retries_once() {
    let h = harness().await;
    h.remote
      .fail_next_writes([SyncError::network("down"), SyncError::network("down")]);
    let request = MutationRequest::new("tasks", MutationKind::Delete, "t2", json!({"id": "t2"}));

    let failure = h
      .coordinator
      .submit_remote(
        request,
        |records: &Payload| records::remove(records, "id", "t2"),
        SubmitOptions::default(),
      )
      .await
      .unwrap_err();

    assert_eq!(failure.status, MutationStatus::Failed);
    assert_eq!(failure.attempts, 2);
    assert!(records::find(&h.cache.peek("tasks").unwrap().data, "id", "t2").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_timeouts_are_retried() {
    let h = harness().await;
    h.remote.set_write_delay(Duration::from_secs(20));
    let (request, apply) = update("t1", json!({"status": "done"}));

    let start = Instant::now();
    let failure = h
      .coordinator
      .submit_remote(request, apply, SubmitOptions::default())
      .await
      .unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::Timeout);
    assert_eq!(failure.status, MutationStatus::Failed);
    // three 10s deadlines plus 1s and 2s of backoff
    assert_eq!(start.elapsed(), Duration::from_secs(33));
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_entity_mutations_are_serialized() {
    let h = harness().await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::new(Mutex::new(None));

    let (first, first_apply) = update("t1", json!({"status": "doing"}));
    let first_order = order.clone();
    let first_call = move || {
      let order = first_order.clone();
      async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        order.lock().unwrap().push("first");
        Ok::<Option<Value>, SyncError>(None)
      }
    };

    let (second, _) = update("t1", json!({"status": "done"}));
    let seen = observed.clone();
    let second_apply = move |records: &Payload| {
      *seen.lock().unwrap() = records::find(records, "id", "t1").map(|r| r["status"].clone());
      records::merge(records, "id", "t1", &json!({"status": "done"}))
    };
    let second_order = order.clone();
    let second_call = move || {
      let order = second_order.clone();
      async move {
        order.lock().unwrap().push("second");
        Ok::<Option<Value>, SyncError>(None)
      }
    };

    let (a, b) = tokio::join!(
      h.coordinator
        .submit(first, first_apply, first_call, SubmitOptions::default()),
      h.coordinator
        .submit(second, second_apply, second_call, SubmitOptions::default()),
    );

    a.unwrap();
    b.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(*observed.lock().unwrap(), Some(json!("doing")));
    assert_eq!(status_of(&h.cache, "t1"), "done");
  }

  #[tokio::test(start_paused = true)]
  async fn test_different_entities_run_concurrently() {
    let h = harness().await;
    h.remote.set_write_delay(Duration::from_secs(1));
    let (first, first_apply) = update("t1", json!({"status": "done"}));
    let (second, second_apply) = update("t2", json!({"status": "done"}));

    let start = Instant::now();
    let (a, b) = tokio::join!(
      h.coordinator
        .submit_remote(first, first_apply, SubmitOptions::default()),
      h.coordinator
        .submit_remote(second, second_apply, SubmitOptions::default()),
    );

    a.unwrap();
    b.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_keeps_other_entity_patch() {
    let h = harness().await;
    let (slow, slow_apply) = update("t1", json!({"status": "done"}));
    let slow_call = || async {
      tokio::time::sleep(Duration::from_secs(2)).await;
      Ok::<Option<Value>, SyncError>(None)
    };
    let (failing, failing_apply) = update("t2", json!({"status": "blocked"}));
    let failing_call = || async { Err::<Option<Value>, _>(SyncError::conflict("t2 changed")) };

    let (a, b) = tokio::join!(
      h.coordinator
        .submit(slow, slow_apply, slow_call, SubmitOptions::default()),
      h.coordinator
        .submit(failing, failing_apply, failing_call, SubmitOptions::default()),
    );

    a.unwrap();
    assert_eq!(b.unwrap_err().kind(), ErrorKind::Conflict);
    assert_eq!(status_of(&h.cache, "t1"), "done");
    assert_eq!(status_of(&h.cache, "t2"), "doing");
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_keeps_newer_fetched_data() {
    let h = harness().await;
    let (request, apply) = update("t1", json!({"status": "done"}));
    let rejected = || async {
      tokio::time::sleep(Duration::from_secs(2)).await;
      Err::<Option<Value>, _>(SyncError::validation("status 'done' requires an assignee"))
    };

    let refresh = async {
      tokio::time::sleep(Duration::from_millis(500)).await;
      h.remote.seed(
        "tasks",
        vec![
          json!({"id": "t1", "title": "Write docs", "status": "todo"}),
          json!({"id": "t2", "title": "Fix bug", "status": "external"}),
        ],
      );
      h.cache.invalidate("tasks");
      h.cache.get("tasks").await.unwrap();
    };

    let (result, ()) = tokio::join!(
      h.coordinator
        .submit(request, apply, rejected, SubmitOptions::default()),
      refresh,
    );
    assert_eq!(result.unwrap_err().status, MutationStatus::RolledBack);

    // Reverted data is stale, so the next read goes back to the server
    let read = h.cache.get_with_meta("tasks").await.unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(records::find(&read.data, "id", "t1").unwrap()["status"], "todo");
    assert_eq!(records::find(&read.data, "id", "t2").unwrap()["status"], "external");
    assert_eq!(h.remote.fetch_count("tasks"), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_submit_reverts_patch() {
    let h = harness().await;
    h.remote.set_write_delay(Duration::from_secs(5));
    let (request, apply) = update("t1", json!({"status": "done"}));

    let abandoned = tokio::time::timeout(
      Duration::from_secs(1),
      h.coordinator
        .submit_remote(request, apply, SubmitOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.coordinator.pending().is_empty());
    let read = h.cache.peek("tasks").unwrap();
    assert!(!read.provisional);
    assert!(read.is_stale());
    assert_eq!(status_of(&h.cache, "t1"), "todo");
    assert_eq!(records::find(&h.remote.records("tasks"), "id", "t1").unwrap()["status"], "todo");

    // The entity lease was released with the dropped future
    h.remote.set_write_delay(Duration::ZERO);
    let (request, apply) = update("t1", json!({"status": "doing"}));
    h.coordinator
      .submit_remote(request, apply, SubmitOptions::default())
      .await
      .unwrap();
    assert_eq!(status_of(&h.cache, "t1"), "doing");
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_reconciles_server_id() {
    let h = harness().await;
    let draft = json!({"id": "tmp-1", "title": "Plan sprint", "status": "todo"});
    let request = MutationRequest::new("tasks", MutationKind::Create, "tmp-1", draft.clone())
      .entity_type("task");

    let outcome = h
      .coordinator
      .submit_remote(
        request,
        move |records: &Payload| records::upsert(records, "id", draft),
        SubmitOptions::default(),
      )
      .await
      .unwrap();

    let data = h.cache.peek("tasks").unwrap().data;
    assert!(records::find(&data, "id", "tmp-1").is_none());
    assert_eq!(records::find(&data, "id", "tasks-1").unwrap()["title"], "Plan sprint");

    let record = outcome.audit_record.unwrap();
    assert_eq!(record.action, AuditAction::Create);
    assert_eq!(record.entity_id, "tasks-1");
    assert!(record.old_value.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_registers_undo_and_restores() {
    let h = harness().await;
    let request = MutationRequest::new("tasks", MutationKind::Delete, "t2", json!({"id": "t2"}))
      .entity_type("task");

    let outcome = h
      .coordinator
      .submit_remote(
        request,
        |records: &Payload| records::remove(records, "id", "t2"),
        SubmitOptions::default(),
      )
      .await
      .unwrap();

    let handle = outcome.undo.unwrap();
    assert!(h.coordinator.undo().is_pending(handle.mutation_id));
    assert!(h.notifier.kinds().contains(&"undoable"));

    let deleted = outcome.audit_record.unwrap();
    assert_eq!(deleted.action, AuditAction::Delete);
    assert_eq!(deleted.old_value.unwrap()["title"], "Fix bug");
    assert!(deleted.new_value.is_none());

    let entity = match h.coordinator.undo().consume(handle.mutation_id).await {
      UndoOutcome::Restored { entity: Some(entity) } => entity,
      other => panic!("expected restore, got {:?}", other),
    };
    assert_eq!(entity["id"], "tasks-1");
    assert_eq!(entity["title"], "Fix bug");
    assert!(records::find(&h.remote.records("tasks"), "id", "tasks-1").is_some());

    let history = h
      .audit
      .query(&AuditFilter::new().action(AuditAction::Restore))
      .await
      .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entity_id, "tasks-1");

    assert_eq!(
      h.coordinator.undo().consume(handle.mutation_id).await,
      UndoOutcome::AlreadyHandled
    );
  }
}
