use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hlc::Hlc;
use crate::ids::QueueItemId;
use crate::row::{self, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(CoreError::UnknownOperation(s.to_string())),
        }
    }
}

/// A single pending mutation awaiting remote application.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub table: String,
    pub operation: Operation,
    /// Entity fields for insert/update; `{id}` for delete.
    pub payload: Row,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: Hlc,
    pub last_attempt_at: Option<Hlc>,
}

impl QueueItem {
    pub fn new(table: &str, operation: Operation, payload: Row, created_at: Hlc) -> Self {
        Self {
            id: QueueItemId::new(),
            table: table.to_string(),
            operation,
            payload,
            retry_count: 0,
            last_error: None,
            created_at,
            last_attempt_at: None,
        }
    }

    /// Retry budget spent; automatic drains skip this item.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Canonical key of the entity this item targets, if the payload has one.
    pub fn entity_key(&self) -> Option<String> {
        row::row_key(&self.payload)
    }

    pub fn targets(&self, table: &str, key: &str) -> bool {
        self.table == table && self.entity_key().as_deref() == Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_names_roundtrip() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()).unwrap(), op);
        }
        assert!(matches!(
            Operation::parse("upsert"),
            Err(CoreError::UnknownOperation(s)) if s == "upsert"
        ));
    }

    #[test]
    fn new_item_starts_with_fresh_retry_budget() {
        let payload = json!({"id": "a-1", "name": "Bessie"}).as_object().cloned().unwrap();
        let item = QueueItem::new("animals", Operation::Insert, payload, Hlc::new(10, 0));
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.is_none());
        assert!(!item.is_exhausted(5));
        assert!(item.targets("animals", "a-1"));
        assert!(!item.targets("feed_logs", "a-1"));
    }

    #[test]
    fn exhausted_at_exact_budget() {
        let mut item = QueueItem::new("animals", Operation::Delete, Row::new(), Hlc::new(1, 0));
        item.retry_count = 4;
        assert!(!item.is_exhausted(5));
        item.retry_count = 5;
        assert!(item.is_exhausted(5));
    }
}
