//! Caller-facing facade over the cache, the mutation coordinator, audit and undo.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditFilter, AuditLogRecorder, AuditRecord, AuditStore, MemoryAuditStore, SqliteAuditStore};
use crate::cache::{CachePartitionManager, CacheRead, CacheSettings, Payload};
use crate::config::Config;
use crate::error::{MutationFailure, SyncError};
use crate::mutation::{
  CoordinatorSettings, MutationCoordinator, MutationId, MutationKind, MutationOutcome,
  MutationRequest, PendingMutation, SubmitOptions,
};
use crate::notify::{Notifier, TracingNotifier};
use crate::records;
use crate::remote::{HttpRemote, RemoteStore};
use crate::undo::{UndoOutcome, UndoRegistry};

pub struct SyncClientBuilder {
  remote: Arc<dyn RemoteStore>,
  audit_store: Option<Arc<dyn AuditStore>>,
  notifier: Option<Arc<dyn Notifier>>,
  cache: CacheSettings,
  coordinator: CoordinatorSettings,
  audit_write_timeout: Duration,
  actor_id: String,
}

impl SyncClientBuilder {
  /// Defaults to an in-memory audit store.
  pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
    self.audit_store = Some(store);
    self
  }

  /// Defaults to [`TracingNotifier`].
  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  pub fn cache_settings(mut self, settings: CacheSettings) -> Self {
    self.cache = settings;
    self
  }

  pub fn coordinator_settings(mut self, settings: CoordinatorSettings) -> Self {
    self.coordinator = settings;
    self
  }

  pub fn audit_write_timeout(mut self, timeout: Duration) -> Self {
    self.audit_write_timeout = timeout;
    self
  }

  /// Actor recorded on audit entries for the convenience mutations.
  pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
    self.actor_id = actor_id.into();
    self
  }

  pub fn build(self) -> SyncClient {
    let store = self
      .audit_store
      .unwrap_or_else(|| Arc::new(MemoryAuditStore::new()));
    let notifier = self
      .notifier
      .unwrap_or_else(|| Arc::new(TracingNotifier));

    let cache = Arc::new(CachePartitionManager::new(
      Arc::clone(&self.remote),
      self.cache,
    ));
    let audit = AuditLogRecorder::new(store, self.audit_write_timeout);
    let coordinator = MutationCoordinator::new(
      Arc::clone(&cache),
      self.remote,
      audit.clone(),
      Arc::new(UndoRegistry::new()),
      notifier,
      self.coordinator,
    );

    SyncClient {
      cache,
      coordinator,
      audit,
      actor_id: self.actor_id,
    }
  }
}

/// Reads go through the partitioned cache, writes through the mutation coordinator.
pub struct SyncClient {
  cache: Arc<CachePartitionManager>,
  coordinator: MutationCoordinator,
  audit: AuditLogRecorder,
  actor_id: String,
}

impl SyncClient {
  pub fn builder(remote: Arc<dyn RemoteStore>) -> SyncClientBuilder {
    SyncClientBuilder {
      remote,
      audit_store: None,
      notifier: None,
      cache: CacheSettings::default(),
      coordinator: CoordinatorSettings::default(),
      audit_write_timeout: Duration::from_secs(2),
      actor_id: "system".to_string(),
    }
  }

  /// HTTP remote plus SQLite audit trail, as described by `config`.
  pub fn from_config(config: &Config) -> Result<Self> {
    let remote = HttpRemote::new(&config.remote.url, &config.mutations.id_field)?;
    let audit_store = SqliteAuditStore::open(&config.audit_path()?)?;

    Ok(
      Self::builder(Arc::new(remote))
        .audit_store(Arc::new(audit_store))
        .cache_settings(config.cache_settings())
        .coordinator_settings(config.coordinator_settings())
        .audit_write_timeout(config.audit_write_timeout())
        .build(),
    )
  }

  pub fn cache(&self) -> &CachePartitionManager {
    &self.cache
  }

  pub fn coordinator(&self) -> &MutationCoordinator {
    &self.coordinator
  }

  pub async fn get(&self, domain: &str) -> Result<Payload, SyncError> {
    self.cache.get(domain).await
  }

  pub async fn get_with_meta(&self, domain: &str) -> Result<CacheRead, SyncError> {
    self.cache.get_with_meta(domain).await
  }

  /// Last-known data without any I/O.
  pub fn peek(&self, domain: &str) -> Option<CacheRead> {
    self.cache.peek(domain)
  }

  pub fn invalidate(&self, domain: &str) {
    self.cache.invalidate(domain);
  }

  pub fn invalidate_all(&self) {
    self.cache.invalidate_all();
  }

  /// Submit a mutation with a caller-supplied optimistic patch and remote call.
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
    self
      .coordinator
      .submit(request, apply, remote_call, options)
      .await
  }

  /// Submit a mutation whose remote write goes through the configured remote store.
  pub async fn submit_remote<A>(
    &self,
    request: MutationRequest,
    apply: A,
    options: SubmitOptions,
  ) -> Result<MutationOutcome, MutationFailure>
  where
    A: FnOnce(&Payload) -> Payload,
  {
    self.coordinator.submit_remote(request, apply, options).await
  }

  /// Create a record. It shows up immediately under a provisional id, which
  /// is swapped for the server's id on commit.
  pub async fn create(&self, domain: &str, record: Value) -> Result<MutationOutcome, MutationFailure> {
    let id_field = self.id_field().to_string();
    let provisional_id = records::record_id(&record, &id_field)
      .unwrap_or_else(|| format!("tmp-{}", Uuid::new_v4()));

    let mut optimistic = record.clone();
    if let Some(fields) = optimistic.as_object_mut() {
      fields
        .entry(id_field.clone())
        .or_insert_with(|| Value::String(provisional_id.clone()));
    }
    debug!(domain, %provisional_id, "creating record");

    let request = MutationRequest::new(domain, MutationKind::Create, provisional_id, record)
      .actor(self.actor_id.clone());
    self
      .submit_remote(
        request,
        move |payload: &Payload| records::upsert(payload, &id_field, optimistic),
        SubmitOptions::default(),
      )
      .await
  }

  /// Shallow-merge `patch` into the record with `id`.
  pub async fn update(
    &self,
    domain: &str,
    id: &str,
    patch: Value,
  ) -> Result<MutationOutcome, MutationFailure> {
    let id_field = self.id_field().to_string();
    let mut payload = patch.clone();
    if let Some(fields) = payload.as_object_mut() {
      fields.insert(id_field.clone(), Value::String(id.to_string()));
    }

    let request =
      MutationRequest::new(domain, MutationKind::Update, id, payload).actor(self.actor_id.clone());
    let id = id.to_string();
    self
      .submit_remote(
        request,
        move |records: &Payload| records::merge(records, &id_field, &id, &patch),
        SubmitOptions::default(),
      )
      .await
  }

  /// Delete the record with `id`. The outcome carries an undo handle.
  pub async fn delete(&self, domain: &str, id: &str) -> Result<MutationOutcome, MutationFailure> {
    let id_field = self.id_field().to_string();
    let mut payload = serde_json::Map::new();
    payload.insert(id_field.clone(), Value::String(id.to_string()));

    let request = MutationRequest::new(domain, MutationKind::Delete, id, Value::Object(payload))
      .actor(self.actor_id.clone());
    let id = id.to_string();
    self
      .submit_remote(
        request,
        move |records: &Payload| records::remove(records, &id_field, &id),
        SubmitOptions::default(),
      )
      .await
  }

  /// Reverse a committed delete, if its undo window is still open.
  pub async fn consume_undo(&self, mutation_id: MutationId) -> UndoOutcome {
    self.coordinator.undo().consume(mutation_id).await
  }

  pub async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
    self.audit.query(filter).await
  }

  pub fn pending(&self) -> Vec<PendingMutation> {
    self.coordinator.pending()
  }

  fn id_field(&self) -> &str {
    &self.coordinator.settings().id_field
  }
}
