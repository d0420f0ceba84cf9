use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use paddock_core::{Hlc, HlcClock, Operation, QueueItem, QueueItemId, Row};
use paddock_storage::{LocalStore, QueueFilter};
use tracing::debug;

use crate::error::EngineError;

/// Ordered log of mutations captured while the remote store was unreachable.
///
/// Replay goes through [`begin_dispatch`](Self::begin_dispatch) and
/// [`finish_dispatch`](Self::finish_dispatch). Purges and delete coalescing
/// take the same lock, so they never remove an item whose remote call is in
/// flight, and a drain never replays an item they already removed.
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    clock: Mutex<HlcClock>,
    in_flight: Mutex<Option<QueueItemId>>,
}

impl MutationQueue {
    /// Wraps `store`, seeding the clock past any item already queued so new
    /// items always sort after old ones.
    pub fn new(store: Arc<dyn LocalStore>) -> Result<Self, EngineError> {
        let mut clock = HlcClock::new();
        if let Some(newest) = store.queue_max_created_at()? {
            clock.observe(newest);
        }
        Ok(Self {
            store,
            clock: Mutex::new(clock),
            in_flight: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    fn clock(&self) -> MutexGuard<'_, HlcClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<QueueItemId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now(&self) -> Result<Hlc, EngineError> {
        Ok(self.clock().tick()?)
    }

    /// Append a mutation. A failed local write is returned as-is: the action
    /// that produced it did not happen, not even optimistically.
    pub fn enqueue(
        &self,
        table: &str,
        operation: Operation,
        payload: Row,
    ) -> Result<QueueItemId, EngineError> {
        // Hold the clock across the write so stamp order matches insert order.
        let mut clock = self.clock();
        let item = QueueItem::new(table, operation, payload, clock.tick()?);
        self.store.queue_add(&item)?;
        debug!(id = %item.id, table, op = operation.as_str(), "queued mutation");
        Ok(item.id)
    }

    pub fn list_pending(&self, table: Option<&str>) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self.store.queue_list(table)?)
    }

    pub fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, EngineError> {
        Ok(self.store.queue_get(id)?)
    }

    pub fn remove(&self, id: QueueItemId) -> Result<(), EngineError> {
        self.store.queue_delete(id)?;
        Ok(())
    }

    pub fn increment_retry(&self, id: QueueItemId, message: &str) -> Result<(), EngineError> {
        let attempted_at = self.now()?;
        self.store.queue_record_failure(id, message, attempted_at)?;
        Ok(())
    }

    pub fn count(&self, filter: &QueueFilter) -> Result<u64, EngineError> {
        Ok(self.store.queue_count(filter)?)
    }

    /// Items whose retry budget is spent. They stay queued until an operator
    /// retries or purges them.
    pub fn failed(&self, max_retries: u32) -> Result<Vec<QueueItem>, EngineError> {
        Ok(self
            .store
            .queue_list(None)?
            .into_iter()
            .filter(|item| item.is_exhausted(max_retries))
            .collect())
    }

    pub fn reset_retries(&self, id: QueueItemId) -> Result<bool, EngineError> {
        Ok(self.store.queue_reset_retries(id)?)
    }

    /// Discard an item. Returns `false` if it is gone or is being replayed
    /// right now.
    pub fn purge(&self, id: QueueItemId) -> Result<bool, EngineError> {
        let in_flight = self.in_flight();
        if *in_flight == Some(id) {
            debug!(%id, "item in flight, not purged");
            return Ok(false);
        }
        Ok(self.store.queue_delete(id)?)
    }

    pub fn purge_failed(&self, max_retries: u32) -> Result<u64, EngineError> {
        let _in_flight = self.in_flight();
        Ok(self.store.queue_delete_failed(max_retries)?)
    }

    /// Re-read `id` and mark it in flight. `None` means it was removed since
    /// the drain listed it and must not be replayed.
    pub(crate) fn begin_dispatch(
        &self,
        id: QueueItemId,
    ) -> Result<Option<QueueItem>, EngineError> {
        let mut in_flight = self.in_flight();
        let item = self.store.queue_get(id)?;
        if item.is_some() {
            *in_flight = Some(id);
        }
        Ok(item)
    }

    /// Settle a replayed item: remove it on success, record the failure
    /// otherwise. The item stays in flight until it is settled.
    pub(crate) fn finish_dispatch(
        &self,
        id: QueueItemId,
        failure: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut in_flight = self.in_flight();
        let settled = match failure {
            None => self.remove(id),
            Some(message) => self.increment_retry(id, message),
        };
        *in_flight = None;
        settled
    }

    /// Purge every pending insert and update of `(table, key)` if the entity
    /// has an insert that never reached the server. Returns the number of
    /// items dropped, or `None` when the entity cannot be coalesced: no
    /// pending insert, or one of its items is being replayed.
    pub(crate) fn coalesce_delete(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<usize>, EngineError> {
        let in_flight = self.in_flight();
        let pending: Vec<QueueItem> = self
            .store
            .queue_list(Some(table))?
            .into_iter()
            .filter(|item| item.targets(table, key))
            .collect();

        if !pending.iter().any(|item| item.operation == Operation::Insert) {
            return Ok(None);
        }
        if pending.iter().any(|item| Some(item.id) == *in_flight) {
            debug!(table, key, "insert in flight, delete queued instead");
            return Ok(None);
        }

        let mut dropped = 0;
        for item in pending.iter().filter(|i| i.operation != Operation::Delete) {
            if self.store.queue_delete(item.id)? {
                dropped += 1;
            }
        }
        Ok(Some(dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paddock_storage::SqliteStorage;
    use serde_json::json;

    fn queue() -> MutationQueue {
        MutationQueue::new(Arc::new(SqliteStorage::open_in_memory().unwrap())).unwrap()
    }

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn enqueue_starts_items_at_zero_retries() {
        let q = queue();
        let id = q
            .enqueue("animals", Operation::Insert, row(json!({"id": "a1", "name": "Clover"})))
            .unwrap();
        let item = q.get(id).unwrap().unwrap();
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.table, "animals");
        assert_eq!(item.operation, Operation::Insert);
    }

    #[test]
    fn list_pending_keeps_enqueue_order_across_tables() {
        let q = queue();
        let a = q.enqueue("animals", Operation::Insert, row(json!({"id": 1}))).unwrap();
        let b = q.enqueue("feed_logs", Operation::Insert, row(json!({"id": 2}))).unwrap();
        let c = q.enqueue("animals", Operation::Update, row(json!({"id": 1, "pen": "D"}))).unwrap();

        let all: Vec<_> = q.list_pending(None).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(all, vec![a, b, c]);
        let animals: Vec<_> = q
            .list_pending(Some("animals"))
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(animals, vec![a, c]);
    }

    #[test]
    fn remove_is_idempotent() {
        let q = queue();
        let id = q.enqueue("animals", Operation::Delete, row(json!({"id": 9}))).unwrap();
        q.remove(id).unwrap();
        q.remove(id).unwrap();
        assert_eq!(q.count(&QueueFilter::All).unwrap(), 0);
    }

    #[test]
    fn increment_retry_ignores_unknown_ids() {
        let q = queue();
        q.increment_retry(QueueItemId::new(), "gone").unwrap();
    }

    #[test]
    fn failed_items_can_be_reset_or_purged() {
        let q = queue();
        let stuck = q.enqueue("animals", Operation::Insert, row(json!({"id": 1}))).unwrap();
        let fine = q.enqueue("animals", Operation::Insert, row(json!({"id": 2}))).unwrap();
        for _ in 0..3 {
            q.increment_retry(stuck, "409 conflict").unwrap();
        }

        let failed = q.failed(3).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, stuck);
        assert_eq!(failed[0].last_error.as_deref(), Some("409 conflict"));

        assert!(q.reset_retries(stuck).unwrap());
        assert!(q.failed(3).unwrap().is_empty());

        for _ in 0..3 {
            q.increment_retry(stuck, "409 conflict").unwrap();
        }
        assert_eq!(q.purge_failed(3).unwrap(), 1);
        let left: Vec<_> = q.list_pending(None).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(left, vec![fine]);
    }

    #[test]
    fn reopened_queue_stamps_after_existing_items() {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let future = Hlc::new(paddock_core::hlc::physical_now().unwrap() + 3_600_000, 0);
        let old = QueueItem::new("animals", Operation::Insert, row(json!({"id": "x"})), future);
        store.queue_add(&old).unwrap();

        let q = MutationQueue::new(Arc::clone(&store)).unwrap();
        let fresh = q.enqueue("animals", Operation::Update, row(json!({"id": "x"}))).unwrap();
        let ids: Vec<_> = q.list_pending(None).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![old.id, fresh]);
    }
}
