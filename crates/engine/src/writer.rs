use std::sync::Arc;

use paddock_core::{Operation, QueueItemId, Row, row};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::remote::RemoteError;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written straight to the remote store.
    Applied,
    /// Captured in the mutation queue; the local cache already reflects it.
    Queued(QueueItemId),
    /// A delete cancelled an insert that never reached the server. `dropped`
    /// queue items were discarded and nothing was queued.
    Coalesced { dropped: usize },
}

/// Entry point for user actions that mutate data.
///
/// Online writes go straight to the remote store unless the entity still has
/// queued mutations, which must land first. Offline writes, and online writes
/// that fail transiently, are queued and patched into the local cache. A
/// remote rejection, or a failed local enqueue, is returned to the caller.
pub struct OfflineWriter {
    engine: Arc<SyncEngine>,
}

impl OfflineWriter {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn insert(&self, table: &str, row: Row) -> Result<WriteOutcome, EngineError> {
        let key = row::row_key(&row);
        if self.should_write_through(table, key.as_deref())? {
            match self.engine.remote().insert(table, &row) {
                Ok(()) => {
                    if key.is_some() {
                        self.patch_cache(|store| store.put_row(table, &row));
                    }
                    return Ok(WriteOutcome::Applied);
                }
                Err(e) => self.fall_back(table, "insert", e)?,
            }
        }

        let id = self.engine.queue().enqueue(table, Operation::Insert, row.clone())?;
        if key.is_some() {
            self.patch_cache(|store| store.put_row(table, &row));
        }
        self.after_enqueue();
        Ok(WriteOutcome::Queued(id))
    }

    pub fn update(&self, table: &str, id: &Value, patch: Row) -> Result<WriteOutcome, EngineError> {
        let key = self.key_for(table, id, "update")?;
        let body = row::without_id(&patch);

        if self.should_write_through(table, Some(&key))? {
            match self.engine.remote().update(table, id, &body) {
                Ok(()) => {
                    self.patch_cached_row(table, &key, id, &body);
                    return Ok(WriteOutcome::Applied);
                }
                Err(e) => self.fall_back(table, "update", e)?,
            }
        }

        let mut payload = body.clone();
        payload.insert(row::ID_FIELD.to_string(), id.clone());
        let queued = self.engine.queue().enqueue(table, Operation::Update, payload)?;
        self.patch_cached_row(table, &key, id, &body);
        self.after_enqueue();
        Ok(WriteOutcome::Queued(queued))
    }

    /// Deletes coalesce with a still-queued insert of the same entity: the
    /// entity never reached the server, so its insert and any updates are
    /// dropped and no delete is queued. If that insert is being replayed right
    /// now, the delete is queued behind it instead.
    pub fn delete(&self, table: &str, id: &Value) -> Result<WriteOutcome, EngineError> {
        let key = self.key_for(table, id, "delete")?;
        let queue = self.engine.queue();

        if let Some(dropped) = queue.coalesce_delete(table, &key)? {
            self.patch_cache(|store| store.delete_row(table, &key).map(|_| ()));
            debug!(table, key = %key, dropped, "delete coalesced with unsynced insert");
            self.after_enqueue();
            return Ok(WriteOutcome::Coalesced { dropped });
        }

        if self.should_write_through(table, Some(&key))? {
            match self.engine.remote().delete(table, id) {
                Ok(()) => {
                    self.patch_cache(|store| store.delete_row(table, &key).map(|_| ()));
                    return Ok(WriteOutcome::Applied);
                }
                Err(e) => self.fall_back(table, "delete", e)?,
            }
        }

        let mut payload = Row::new();
        payload.insert(row::ID_FIELD.to_string(), id.clone());
        let queued = queue.enqueue(table, Operation::Delete, payload)?;
        self.patch_cache(|store| store.delete_row(table, &key).map(|_| ()));
        self.after_enqueue();
        Ok(WriteOutcome::Queued(queued))
    }

    fn key_for(
        &self,
        table: &str,
        id: &Value,
        operation: &'static str,
    ) -> Result<String, EngineError> {
        row::entity_key(id).ok_or_else(|| EngineError::MissingEntityId {
            table: table.to_string(),
            operation,
        })
    }

    fn should_write_through(&self, table: &str, key: Option<&str>) -> Result<bool, EngineError> {
        if !self.engine.connectivity().is_online() {
            return Ok(false);
        }
        let Some(key) = key else {
            return Ok(true);
        };
        let blocked = self
            .engine
            .queue()
            .list_pending(Some(table))?
            .iter()
            .any(|item| item.targets(table, key));
        Ok(!blocked)
    }

    /// Transient failures fall through to the queue; rejections go back to
    /// the caller.
    fn fall_back(&self, table: &str, operation: &str, e: RemoteError) -> Result<(), EngineError> {
        if e.transient {
            warn!(table, operation, error = %e, "direct write failed, queueing");
            Ok(())
        } else {
            Err(e.into())
        }
    }

    fn patch_cached_row(&self, table: &str, key: &str, id: &Value, patch: &Row) {
        self.patch_cache(|store| {
            let merged = match store.get_row(table, key)? {
                Some(cached) => row::overlay(&cached, patch),
                None => {
                    let mut fresh = patch.clone();
                    fresh.insert(row::ID_FIELD.to_string(), id.clone());
                    fresh
                }
            };
            store.put_row(table, &merged)
        });
    }

    /// Cache patches are best effort: the mutation itself is already durable.
    fn patch_cache<F>(&self, apply: F)
    where
        F: FnOnce(&dyn paddock_storage::LocalStore) -> Result<(), paddock_storage::StorageError>,
    {
        let store = self.engine.queue().store();
        if let Err(e) = apply(store.as_ref()) {
            warn!(error = %e, "could not patch local cache");
        }
    }

    fn after_enqueue(&self) {
        if let Err(e) = self.engine.refresh_status() {
            warn!(error = %e, "could not refresh sync status");
        }
    }
}
