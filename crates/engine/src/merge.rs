//! Optimistic view of a collection: server rows with unsynced local
//! mutations laid on top.

use std::collections::{HashMap, HashSet};

use paddock_core::{Operation, QueueItem, QueueItemId, Row, row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrigin {
    /// Not yet confirmed by the server; `Operation` is the latest queued change.
    Pending(Operation),
    Server,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub row: Row,
    pub origin: RowOrigin,
    /// Latest queue item contributing to this row.
    pub queue_item: Option<QueueItemId>,
}

impl MergedRow {
    pub fn is_pending(&self) -> bool {
        matches!(self.origin, RowOrigin::Pending(_))
    }
}

struct PendingEntity {
    row: Option<Row>,
    last_op: Operation,
    last_item: QueueItemId,
}

/// Merge one collection's server rows with its pending queue items.
///
/// Pending entities come first, in the order they were first queued, and
/// shadow any server row with the same id. Updates are laid over the server
/// row when there is one. Entities whose latest pending change is a delete
/// are hidden entirely. Pending items without an id (server-assigned keys)
/// are listed as-is.
pub fn merge_pending(server_rows: &[Row], pending: &[QueueItem]) -> Vec<MergedRow> {
    let by_key: HashMap<String, &Row> = server_rows
        .iter()
        .filter_map(|r| row::row_key(r).map(|k| (k, r)))
        .collect();

    let mut order: Vec<String> = Vec::new();
    let mut entities: HashMap<String, PendingEntity> = HashMap::new();
    let mut keyless: Vec<MergedRow> = Vec::new();

    for item in pending {
        let Some(key) = item.entity_key() else {
            if item.operation != Operation::Delete {
                keyless.push(MergedRow {
                    row: item.payload.clone(),
                    origin: RowOrigin::Pending(item.operation),
                    queue_item: Some(item.id),
                });
            }
            continue;
        };

        let entry = entities.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            PendingEntity {
                row: by_key.get(&key).map(|r| (*r).clone()),
                last_op: item.operation,
                last_item: item.id,
            }
        });

        entry.row = match item.operation {
            Operation::Insert => Some(item.payload.clone()),
            Operation::Update => Some(match &entry.row {
                Some(base) => row::overlay(base, &item.payload),
                None => item.payload.clone(),
            }),
            Operation::Delete => None,
        };
        entry.last_op = item.operation;
        entry.last_item = item.id;
    }

    let shadowed: HashSet<&String> = order.iter().collect();
    let mut merged = Vec::with_capacity(order.len() + keyless.len() + server_rows.len());

    for key in &order {
        if let Some(PendingEntity {
            row: Some(row),
            last_op,
            last_item,
        }) = entities.remove(key)
        {
            merged.push(MergedRow {
                row,
                origin: RowOrigin::Pending(last_op),
                queue_item: Some(last_item),
            });
        }
    }
    merged.extend(keyless);

    for server in server_rows {
        let hidden = row::row_key(server)
            .map(|k| shadowed.contains(&k))
            .unwrap_or(false);
        if !hidden {
            merged.push(MergedRow {
                row: server.clone(),
                origin: RowOrigin::Server,
                queue_item: None,
            });
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use paddock_core::Hlc;
    use serde_json::{Value, json};

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn pending(op: Operation, payload: Value, n: u64) -> QueueItem {
        QueueItem::new("animals", op, row(payload), Hlc::new(n, 0))
    }

    fn ids(rows: &[MergedRow]) -> Vec<Value> {
        rows.iter().map(|r| r.row["id"].clone()).collect()
    }

    #[test]
    fn pending_rows_lead_and_shadow_server_rows() {
        let server = vec![
            row(json!({"id": "a", "name": "Annabelle", "pen": "A"})),
            row(json!({"id": "b", "name": "Buttercup", "pen": "A"})),
        ];
        let queue = vec![
            pending(Operation::Insert, json!({"id": "c", "name": "Clarabelle"}), 1),
            pending(Operation::Update, json!({"id": "b", "pen": "C"}), 2),
        ];

        let merged = merge_pending(&server, &queue);
        assert_eq!(ids(&merged), vec![json!("c"), json!("b"), json!("a")]);
        assert!(merged[0].is_pending());
        assert_eq!(merged[1].origin, RowOrigin::Pending(Operation::Update));
        assert_eq!(merged[1].row["name"], json!("Buttercup"));
        assert_eq!(merged[1].row["pen"], json!("C"));
        assert_eq!(merged[2].origin, RowOrigin::Server);
    }

    #[test]
    fn pending_delete_hides_server_row() {
        let server = vec![row(json!({"id": 1})), row(json!({"id": 2}))];
        let queue = vec![pending(Operation::Delete, json!({"id": 1}), 1)];
        let merged = merge_pending(&server, &queue);
        assert_eq!(ids(&merged), vec![json!(2)]);
    }

    #[test]
    fn insert_then_update_folds_into_one_row() {
        let queue = vec![
            pending(Operation::Insert, json!({"id": "k", "weight_kg": 30}), 1),
            pending(Operation::Update, json!({"id": "k", "weight_kg": 34}), 2),
        ];
        let merged = merge_pending(&[], &queue);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].row["weight_kg"], json!(34));
        assert_eq!(merged[0].queue_item, Some(queue[1].id));
    }

    #[test]
    fn keyless_inserts_are_listed_after_keyed_pending() {
        let queue = vec![
            pending(Operation::Insert, json!({"name": "calf without tag"}), 1),
            pending(Operation::Insert, json!({"id": "t", "name": "tagged"}), 2),
        ];
        let merged = merge_pending(&[row(json!({"id": "s"}))], &queue);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].row["id"], json!("t"));
        assert_eq!(merged[1].row["name"], json!("calf without tag"));
        assert_eq!(merged[2].origin, RowOrigin::Server);
    }
}
