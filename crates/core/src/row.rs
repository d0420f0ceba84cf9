use serde_json::{Map, Value};

use crate::CoreError;

/// A remote row as a JSON object, keyed by column name.
pub type Row = Map<String, Value>;

pub const ID_FIELD: &str = "id";

/// The remote identifier carried by a row, if any. `null` counts as absent.
pub fn entity_id(row: &Row) -> Option<&Value> {
    row.get(ID_FIELD).filter(|v| !v.is_null())
}

/// Canonical string key for a remote identifier. Strings are taken as-is,
/// numbers are rendered in decimal; anything else is not a usable key.
pub fn entity_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Shorthand for `entity_id` followed by `entity_key`.
pub fn row_key(row: &Row) -> Option<String> {
    entity_id(row).and_then(entity_key)
}

/// Copy of `row` with the id column removed, used as an update body.
pub fn without_id(row: &Row) -> Row {
    row.iter()
        .filter(|(k, _)| k.as_str() != ID_FIELD)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Lay `patch` over `base`, column by column.
pub fn overlay(base: &Row, patch: &Row) -> Row {
    let mut merged = base.clone();
    for (k, v) in patch {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

pub fn to_msgpack(row: &Row) -> Result<Vec<u8>, CoreError> {
    rmp_serde::to_vec(row).map_err(|e| CoreError::Serialization(e.to_string()))
}

pub fn from_msgpack(bytes: &[u8]) -> Result<Row, CoreError> {
    rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
}
