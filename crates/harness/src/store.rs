use std::sync::atomic::{AtomicBool, Ordering};

use paddock_core::{Hlc, QueueItem, QueueItemId, Row};
use paddock_storage::{
    CollectionRecord, LocalStore, QueueFilter, SqliteStorage, StorageError,
};

/// In-memory SQLite store that can be told to fail reads or writes, for
/// exercising the paths where the device storage itself misbehaves.
pub struct FlakyStore {
    inner: SqliteStorage,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            inner: SqliteStorage::open_in_memory()?,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    fn write(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::ConstraintViolation("disk full".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::ConstraintViolation("database locked".into()));
        }
        Ok(())
    }
}

impl LocalStore for FlakyStore {
    fn queue_add(&self, item: &QueueItem) -> Result<(), StorageError> {
        self.write()?;
        self.inner.queue_add(item)
    }

    fn queue_list(&self, table: Option<&str>) -> Result<Vec<QueueItem>, StorageError> {
        self.read()?;
        self.inner.queue_list(table)
    }

    fn queue_get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StorageError> {
        self.read()?;
        self.inner.queue_get(id)
    }

    fn queue_delete(&self, id: QueueItemId) -> Result<bool, StorageError> {
        self.write()?;
        self.inner.queue_delete(id)
    }

    fn queue_record_failure(
        &self,
        id: QueueItemId,
        message: &str,
        attempted_at: Hlc,
    ) -> Result<bool, StorageError> {
        self.write()?;
        self.inner.queue_record_failure(id, message, attempted_at)
    }

    fn queue_reset_retries(&self, id: QueueItemId) -> Result<bool, StorageError> {
        self.write()?;
        self.inner.queue_reset_retries(id)
    }

    fn queue_delete_failed(&self, max_retries: u32) -> Result<u64, StorageError> {
        self.write()?;
        self.inner.queue_delete_failed(max_retries)
    }

    fn queue_count(&self, filter: &QueueFilter) -> Result<u64, StorageError> {
        self.read()?;
        self.inner.queue_count(filter)
    }

    fn queue_max_created_at(&self) -> Result<Option<Hlc>, StorageError> {
        self.read()?;
        self.inner.queue_max_created_at()
    }

    fn replace_collection(
        &self,
        collection: &str,
        rows: &[Row],
        fetched_at: u64,
    ) -> Result<usize, StorageError> {
        self.write()?;
        self.inner.replace_collection(collection, rows, fetched_at)
    }

    fn clear_collection(&self, collection: &str) -> Result<(), StorageError> {
        self.write()?;
        self.inner.clear_collection(collection)
    }

    fn put_row(&self, collection: &str, row: &Row) -> Result<(), StorageError> {
        self.write()?;
        self.inner.put_row(collection, row)
    }

    fn get_row(&self, collection: &str, key: &str) -> Result<Option<Row>, StorageError> {
        self.read()?;
        self.inner.get_row(collection, key)
    }

    fn delete_row(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        self.write()?;
        self.inner.delete_row(collection, key)
    }

    fn rows(&self, collection: &str) -> Result<Vec<Row>, StorageError> {
        self.read()?;
        self.inner.rows(collection)
    }

    fn cached_collections(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        self.read()?;
        self.inner.cached_collections()
    }
}

/// Reachability check a test can flip by hand.
#[derive(Default)]
pub struct SwitchProbe(AtomicBool);

impl SwitchProbe {
    pub fn new(reachable: bool) -> Self {
        Self(AtomicBool::new(reachable))
    }

    pub fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

impl paddock_engine::ReachabilityProbe for SwitchProbe {
    fn is_reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
