//! Record-level helpers for domain payloads.
//!
//! A domain payload is an ordered list of JSON records. Records are matched by
//! an id field (usually `"id"`); ids may be strings or numbers.

use serde_json::Value;

use crate::cache::Payload;

/// Render a record's id as a string, if it has one.
pub fn record_id(record: &Value, id_field: &str) -> Option<String> {
  match record.get(id_field)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub fn position(records: &[Value], id_field: &str, id: &str) -> Option<usize> {
  records
    .iter()
    .position(|r| record_id(r, id_field).as_deref() == Some(id))
}

pub fn find<'a>(records: &'a [Value], id_field: &str, id: &str) -> Option<&'a Value> {
  position(records, id_field, id).map(|i| &records[i])
}

/// Replace the record with the same id, or append it.
pub fn upsert(records: &Payload, id_field: &str, record: Value) -> Payload {
  let mut out = records.clone();
  match record_id(&record, id_field).and_then(|id| position(&out, id_field, &id)) {
    Some(i) => out[i] = record,
    None => out.push(record),
  }
  out
}

/// Replace the record carrying `id` (which may differ from the new record's own id), or upsert.
pub fn replace(records: &Payload, id_field: &str, id: &str, record: Value) -> Payload {
  match position(records, id_field, id) {
    Some(i) => {
      let mut out = records.clone();
      out[i] = record;
      out
    }
    None => upsert(records, id_field, record),
  }
}

pub fn remove(records: &Payload, id_field: &str, id: &str) -> Payload {
  records
    .iter()
    .filter(|r| record_id(r, id_field).as_deref() != Some(id))
    .cloned()
    .collect()
}

/// Shallow-merge `patch` into the record with `id`. Records without that id are untouched.
pub fn merge(records: &Payload, id_field: &str, id: &str, patch: &Value) -> Payload {
  let mut out = records.clone();
  if let Some(i) = position(&out, id_field, id) {
    if let (Some(target), Some(fields)) = (out[i].as_object_mut(), patch.as_object()) {
      for (k, v) in fields {
        target.insert(k.clone(), v.clone());
      }
    }
  }
  out
}

/// Put one entity back to how it looked in `snapshot`.
///
/// If the snapshot had the record, it is restored at its old position (or
/// replaces whatever now carries that id). If it did not, the record is
/// removed. Every other record in `current` is left alone.
pub fn restore_entity(current: &Payload, snapshot: &[Value], id_field: &str, id: &str) -> Payload {
  match position(snapshot, id_field, id) {
    Some(old_index) => {
      let old = snapshot[old_index].clone();
      let mut out = current.clone();
      match position(&out, id_field, id) {
        Some(i) => out[i] = old,
        None => {
          let at = old_index.min(out.len());
          out.insert(at, old);
        }
      }
      out
    }
    None => remove(current, id_field, id),
  }
}
