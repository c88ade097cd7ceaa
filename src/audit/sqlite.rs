//! SQLite-backed audit store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection};

use super::record::{AuditAction, AuditEntry, AuditFilter, AuditRecord};
use super::store::AuditStore;

/// Schema for the audit trail.
const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    actor_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entity
    ON audit_log(entity_type, entity_id, recorded_at);

CREATE INDEX IF NOT EXISTS idx_audit_recorded
    ON audit_log(recorded_at);
"#;

/// Audit store persisted to a SQLite database.
///
/// Statements run on the blocking pool so callers on the async runtime never
/// wait on disk I/O directly.
#[derive(Clone)]
pub struct SqliteAuditStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
  /// Open (or create) the audit database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create audit directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open audit database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Audit store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("optisync").join("audit.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(AUDIT_SCHEMA)
      .map_err(|e| eyre!("Failed to run audit migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Audit task failed: {}", e))?
  }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
  async fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
    self
      .with_conn(move |conn| {
        let old_value = entry
          .old_value
          .as_ref()
          .map(serde_json::to_string)
          .transpose()
          .map_err(|e| eyre!("Failed to serialize old value: {}", e))?;
        let new_value = entry
          .new_value
          .as_ref()
          .map(serde_json::to_string)
          .transpose()
          .map_err(|e| eyre!("Failed to serialize new value: {}", e))?;

        conn
          .execute(
            "INSERT INTO audit_log (entity_type, entity_id, action, old_value, new_value, actor_id, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
              entry.entity_type,
              entry.entity_id,
              entry.action.as_str(),
              old_value,
              new_value,
              entry.actor_id,
              format_timestamp(&entry.recorded_at),
            ],
          )
          .map_err(|e| eyre!("Failed to append audit record: {}", e))?;

        let id = conn.last_insert_rowid() as u64;
        Ok(AuditRecord::from_entry(id, entry))
      })
      .await
  }

  async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
    let filter = filter.clone();
    self
      .with_conn(move |conn| {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql + Send>> = Vec::new();

        if let Some(entity_type) = filter.entity_type {
          clauses.push("entity_type = ?");
          values.push(Box::new(entity_type));
        }
        if let Some(entity_id) = filter.entity_id {
          clauses.push("entity_id = ?");
          values.push(Box::new(entity_id));
        }
        if let Some(action) = filter.action {
          clauses.push("action = ?");
          values.push(Box::new(action.as_str()));
        }
        if let Some(since) = filter.since {
          clauses.push("recorded_at >= ?");
          values.push(Box::new(format_timestamp(&since)));
        }
        if let Some(until) = filter.until {
          clauses.push("recorded_at <= ?");
          values.push(Box::new(format_timestamp(&until)));
        }

        let mut sql = String::from(
          "SELECT id, entity_type, entity_id, action, old_value, new_value, actor_id, recorded_at
           FROM audit_log",
        );
        if !clauses.is_empty() {
          sql.push_str(" WHERE ");
          sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY recorded_at DESC, id DESC");
        if let Some(limit) = filter.limit {
          sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn
          .prepare(&sql)
          .map_err(|e| eyre!("Failed to prepare audit query: {}", e))?;

        let rows = stmt
          .query_map(params_from_iter(values.iter().map(|v| v.as_ref())), |row| {
            Ok(RawAuditRow {
              id: row.get(0)?,
              entity_type: row.get(1)?,
              entity_id: row.get(2)?,
              action: row.get(3)?,
              old_value: row.get(4)?,
              new_value: row.get(5)?,
              actor_id: row.get(6)?,
              recorded_at: row.get(7)?,
            })
          })
          .map_err(|e| eyre!("Failed to query audit log: {}", e))?;

        let mut records = Vec::new();
        for row in rows {
          let row = row.map_err(|e| eyre!("Failed to read audit row: {}", e))?;
          records.push(row.into_record()?);
        }
        Ok(records)
      })
      .await
  }

  async fn count(&self) -> Result<usize> {
    self
      .with_conn(|conn| {
        let count: i64 = conn
          .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
          .map_err(|e| eyre!("Failed to count audit records: {}", e))?;
        Ok(count as usize)
      })
      .await
  }
}

/// Row as stored, before parsing JSON and timestamps.
struct RawAuditRow {
  id: i64,
  entity_type: String,
  entity_id: String,
  action: String,
  old_value: Option<String>,
  new_value: Option<String>,
  actor_id: String,
  recorded_at: String,
}

impl RawAuditRow {
  fn into_record(self) -> Result<AuditRecord> {
    let parse_json = |s: Option<String>| -> Result<Option<serde_json::Value>> {
      s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| eyre!("Failed to parse stored value of audit record {}: {}", self.id, e))
    };

    Ok(AuditRecord {
      id: self.id as u64,
      action: self.action.parse::<AuditAction>()?,
      old_value: parse_json(self.old_value.clone())?,
      new_value: parse_json(self.new_value.clone())?,
      recorded_at: parse_timestamp(&self.recorded_at)?,
      entity_type: self.entity_type,
      entity_id: self.entity_id,
      actor_id: self.actor_id,
    })
  }
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
fn format_timestamp(at: &DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn entry(entity_id: &str, action: AuditAction, at: DateTime<Utc>) -> AuditEntry {
    AuditEntry {
      entity_type: "deal".into(),
      entity_id: entity_id.into(),
      action,
      old_value: Some(json!({"id": entity_id, "stage": "lead"})),
      new_value: None,
      actor_id: "bob".into(),
      recorded_at: at,
    }
  }

  #[tokio::test]
  async fn test_append_and_read_back() {
    let store = SqliteAuditStore::open_in_memory().unwrap();
    let at = Utc::now();

    let stored = store
      .append(entry("d1", AuditAction::Delete, at))
      .await
      .unwrap();
    let read = store.query(&AuditFilter::new()).await.unwrap();

    assert_eq!(read.len(), 1);
    assert_eq!(read[0].id, stored.id);
    assert_eq!(read[0].action, AuditAction::Delete);
    assert_eq!(read[0].old_value, Some(json!({"id": "d1", "stage": "lead"})));
    assert_eq!(read[0].new_value, None);
    assert_eq!(format_timestamp(&read[0].recorded_at), format_timestamp(&at));
  }

  #[tokio::test]
  async fn test_query_filters_and_order() {
    let store = SqliteAuditStore::open_in_memory().unwrap();
    let base = Utc::now();

    store.append(entry("d1", AuditAction::Create, base)).await.unwrap();
    store
      .append(entry("d1", AuditAction::Update, base + Duration::seconds(5)))
      .await
      .unwrap();
    store
      .append(entry("d2", AuditAction::Create, base + Duration::seconds(10)))
      .await
      .unwrap();

    let d1 = store.query(&AuditFilter::for_entity("deal", "d1")).await.unwrap();
    assert_eq!(d1.len(), 2);
    assert_eq!(d1[0].action, AuditAction::Update);
    assert_eq!(d1[1].action, AuditAction::Create);

    let window = store
      .query(
        &AuditFilter::new()
          .since(base + Duration::seconds(1))
          .until(base + Duration::seconds(9)),
      )
      .await
      .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].entity_id, "d1");

    let creates = store
      .query(&AuditFilter::new().action(AuditAction::Create).limit(1))
      .await
      .unwrap();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].entity_id, "d2");

    assert_eq!(store.count().await.unwrap(), 3);
  }
}
