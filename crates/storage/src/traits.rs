use paddock_core::{Hlc, QueueItem, QueueItemId, Row};

use crate::error::StorageError;

/// Which queue rows a count covers. Counting never decodes payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueFilter {
    All,
    Table(String),
    /// Items still inside their retry budget.
    Eligible { max_retries: u32 },
    /// Items whose retry budget is spent.
    Failed { max_retries: u32 },
}

/// Manifest entry for a prefetched collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    pub collection: String,
    pub fetched_at: u64,
    pub row_count: u64,
}

/// The on-device durable store: a mutation queue plus per-collection
/// snapshots of remote rows.
///
/// Every call is a single statement or transaction, so a reader never sees a
/// half-written queue item.
pub trait LocalStore: Send + Sync {
    fn queue_add(&self, item: &QueueItem) -> Result<(), StorageError>;

    /// Items in creation order, optionally restricted to one table.
    fn queue_list(&self, table: Option<&str>) -> Result<Vec<QueueItem>, StorageError>;

    fn queue_get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StorageError>;

    /// Returns whether a row was removed.
    fn queue_delete(&self, id: QueueItemId) -> Result<bool, StorageError>;

    /// Bump `retry_count`, store the message and stamp the attempt time.
    /// Returns whether the item existed.
    fn queue_record_failure(
        &self,
        id: QueueItemId,
        message: &str,
        attempted_at: Hlc,
    ) -> Result<bool, StorageError>;

    fn queue_reset_retries(&self, id: QueueItemId) -> Result<bool, StorageError>;

    fn queue_delete_failed(&self, max_retries: u32) -> Result<u64, StorageError>;

    fn queue_count(&self, filter: &QueueFilter) -> Result<u64, StorageError>;

    fn queue_max_created_at(&self) -> Result<Option<Hlc>, StorageError>;

    /// Replace every cached row of `collection` and record it in the manifest,
    /// atomically. Returns the number of rows stored.
    fn replace_collection(
        &self,
        collection: &str,
        rows: &[Row],
        fetched_at: u64,
    ) -> Result<usize, StorageError>;

    /// Drop a collection's rows and its manifest entry.
    fn clear_collection(&self, collection: &str) -> Result<(), StorageError>;

    fn put_row(&self, collection: &str, row: &Row) -> Result<(), StorageError>;

    fn get_row(&self, collection: &str, key: &str) -> Result<Option<Row>, StorageError>;

    fn delete_row(&self, collection: &str, key: &str) -> Result<bool, StorageError>;

    fn rows(&self, collection: &str) -> Result<Vec<Row>, StorageError>;

    fn cached_collections(&self) -> Result<Vec<CollectionRecord>, StorageError>;
}
