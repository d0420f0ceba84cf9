use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use paddock_core::{
    Hlc, Operation, QueueItem, QueueItemId, Row,
    row::{self, row_key},
};

use crate::error::StorageError;
use crate::traits::{CollectionRecord, LocalStore, QueueFilter};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

const QUEUE_COLUMNS: &str = "queue_id, table_name, operation, payload, retry_count, \
     last_error, created_at, last_attempt_at";

/// Raw column values of one `sync_queue` row, decoded outside the
/// `query_map` closure so decode errors keep their `StorageError` type.
type RawQueueRow = (
    Vec<u8>,
    String,
    String,
    Vec<u8>,
    i64,
    Option<String>,
    Vec<u8>,
    Option<Vec<u8>>,
);

fn read_raw(row: &rusqlite::Row) -> rusqlite::Result<RawQueueRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_item(raw: RawQueueRow) -> Result<QueueItem, StorageError> {
    let (id_bytes, table, op, payload, retry_count, last_error, created_at, last_attempt_at) = raw;
    let last_attempt_at = match last_attempt_at {
        Some(bytes) => Some(Hlc::from_bytes(&to_array::<12>(bytes, "last_attempt_at")?)),
        None => None,
    };
    Ok(QueueItem {
        id: QueueItemId::from_bytes(to_array::<16>(id_bytes, "queue_id")?),
        table,
        operation: Operation::parse(&op)?,
        payload: row::from_msgpack(&payload)?,
        retry_count: u32::try_from(retry_count).map_err(|_| {
            StorageError::Serialization(format!("invalid retry_count {retry_count}"))
        })?,
        last_error,
        created_at: Hlc::from_bytes(&to_array::<12>(created_at, "created_at")?),
        last_attempt_at,
    })
}

/// SQLite-backed [`LocalStore`]. The connection sits behind a mutex so one
/// store can be shared between the sync engine and any number of readers.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl LocalStore for SqliteStorage {
    fn queue_add(&self, item: &QueueItem) -> Result<(), StorageError> {
        let payload = row::to_msgpack(&item.payload)?;
        self.conn()?.execute(
            "INSERT INTO sync_queue (queue_id, table_name, operation, payload, retry_count, \
             last_error, created_at, last_attempt_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                item.id.as_bytes().as_slice(),
                item.table,
                item.operation.as_str(),
                payload,
                item.retry_count as i64,
                item.last_error,
                &item.created_at.to_bytes()[..],
                item.last_attempt_at.map(|h| h.to_bytes().to_vec()),
            ],
        )?;
        Ok(())
    }

    fn queue_list(&self, table: Option<&str>) -> Result<Vec<QueueItem>, StorageError> {
        let conn = self.conn()?;
        let raw = match table {
            Some(table) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE table_name = ?1 \
                     ORDER BY created_at, seq"
                ))?;
                stmt.query_map(rusqlite::params![table], read_raw)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY created_at, seq"
                ))?;
                stmt.query_map([], read_raw)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        drop(conn);
        raw.into_iter().map(decode_item).collect()
    }

    fn queue_get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StorageError> {
        let raw = self
            .conn()?
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE queue_id = ?1"),
                rusqlite::params![id.as_bytes().as_slice()],
                read_raw,
            )
            .optional()?;
        raw.map(decode_item).transpose()
    }

    fn queue_delete(&self, id: QueueItemId) -> Result<bool, StorageError> {
        let changed = self.conn()?.execute(
            "DELETE FROM sync_queue WHERE queue_id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
        )?;
        Ok(changed > 0)
    }

    fn queue_record_failure(
        &self,
        id: QueueItemId,
        message: &str,
        attempted_at: Hlc,
    ) -> Result<bool, StorageError> {
        let changed = self.conn()?.execute(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?1, \
             last_attempt_at = ?2 WHERE queue_id = ?3",
            rusqlite::params![
                message,
                &attempted_at.to_bytes()[..],
                id.as_bytes().as_slice(),
            ],
        )?;
        Ok(changed > 0)
    }

    fn queue_reset_retries(&self, id: QueueItemId) -> Result<bool, StorageError> {
        let changed = self.conn()?.execute(
            "UPDATE sync_queue SET retry_count = 0, last_error = NULL, last_attempt_at = NULL \
             WHERE queue_id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
        )?;
        Ok(changed > 0)
    }

    fn queue_delete_failed(&self, max_retries: u32) -> Result<u64, StorageError> {
        let changed = self.conn()?.execute(
            "DELETE FROM sync_queue WHERE retry_count >= ?1",
            rusqlite::params![max_retries as i64],
        )?;
        Ok(changed as u64)
    }

    fn queue_count(&self, filter: &QueueFilter) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let count: i64 = match filter {
            QueueFilter::All => {
                conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?
            }
            QueueFilter::Table(table) => conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE table_name = ?1",
                rusqlite::params![table],
                |row| row.get(0),
            )?,
            QueueFilter::Eligible { max_retries } => conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE retry_count < ?1",
                rusqlite::params![*max_retries as i64],
                |row| row.get(0),
            )?,
            QueueFilter::Failed { max_retries } => conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE retry_count >= ?1",
                rusqlite::params![*max_retries as i64],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    fn queue_max_created_at(&self) -> Result<Option<Hlc>, StorageError> {
        let bytes: Option<Vec<u8>> = self.conn()?.query_row(
            "SELECT MAX(created_at) FROM sync_queue",
            [],
            |row| row.get(0),
        )?;
        match bytes {
            Some(bytes) => Ok(Some(Hlc::from_bytes(&to_array::<12>(bytes, "created_at")?))),
            None => Ok(None),
        }
    }

    fn replace_collection(
        &self,
        collection: &str,
        rows: &[Row],
        fetched_at: u64,
    ) -> Result<usize, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM cache_rows WHERE collection = ?1",
            rusqlite::params![collection],
        )?;

        let mut stored = 0usize;
        for row in rows {
            let Some(key) = row_key(row) else {
                warn!(collection, "skipping remote row without a usable id");
                continue;
            };
            tx.execute(
                "INSERT OR REPLACE INTO cache_rows (collection, entity_key, row) \
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![collection, key, row::to_msgpack(row)?],
            )?;
            stored += 1;
        }

        tx.execute(
            "INSERT INTO cache_manifest (collection, fetched_at, row_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection) DO UPDATE
             SET fetched_at = excluded.fetched_at, row_count = excluded.row_count",
            rusqlite::params![collection, fetched_at as i64, stored as i64],
        )?;

        tx.commit()?;
        Ok(stored)
    }

    fn clear_collection(&self, collection: &str) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM cache_rows WHERE collection = ?1",
            rusqlite::params![collection],
        )?;
        tx.execute(
            "DELETE FROM cache_manifest WHERE collection = ?1",
            rusqlite::params![collection],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn put_row(&self, collection: &str, row: &Row) -> Result<(), StorageError> {
        let key = row_key(row).ok_or_else(|| {
            StorageError::ConstraintViolation(format!("row for {collection} has no usable id"))
        })?;
        self.conn()?.execute(
            "INSERT INTO cache_rows (collection, entity_key, row) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, entity_key) DO UPDATE SET row = excluded.row",
            rusqlite::params![collection, key, row::to_msgpack(row)?],
        )?;
        Ok(())
    }

    fn get_row(&self, collection: &str, key: &str) -> Result<Option<Row>, StorageError> {
        let bytes: Option<Vec<u8>> = self
            .conn()?
            .query_row(
                "SELECT row FROM cache_rows WHERE collection = ?1 AND entity_key = ?2",
                rusqlite::params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => Ok(Some(row::from_msgpack(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_row(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        let changed = self.conn()?.execute(
            "DELETE FROM cache_rows WHERE collection = ?1 AND entity_key = ?2",
            rusqlite::params![collection, key],
        )?;
        Ok(changed > 0)
    }

    fn rows(&self, collection: &str) -> Result<Vec<Row>, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT row FROM cache_rows WHERE collection = ?1 ORDER BY rowid")?;
        let blobs = stmt
            .query_map(rusqlite::params![collection], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(blobs.len());
        for bytes in blobs {
            result.push(row::from_msgpack(&bytes)?);
        }
        Ok(result)
    }

    fn cached_collections(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT collection, fetched_at, row_count FROM cache_manifest ORDER BY collection",
        )?;
        let records = stmt
            .query_map([], |row| {
                let collection: String = row.get(0)?;
                let fetched_at: i64 = row.get(1)?;
                let row_count: i64 = row.get(2)?;
                Ok(CollectionRecord {
                    collection,
                    fetched_at: fetched_at as u64,
                    row_count: row_count as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn item(table: &str, op: Operation, payload: serde_json::Value, wall: u64) -> QueueItem {
        QueueItem::new(table, op, row(payload), Hlc::new(wall, 0))
    }

    #[test]
    fn schema_version_is_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versioned.db");
        let path = path.to_str().unwrap();
        drop(SqliteStorage::open(path).unwrap());

        let store = SqliteStorage::open(path).unwrap();
        let conn = store.conn().unwrap();
        let versions: Vec<i32> = conn
            .prepare("SELECT version FROM schema_version")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(versions, vec![crate::schema::SCHEMA_VERSION]);
    }

    #[test]
    fn queue_lists_in_creation_order() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let late = item("animals", Operation::Update, json!({"id": "a", "pen": "B"}), 300);
        let early = item("animals", Operation::Insert, json!({"id": "a"}), 100);
        let middle = item("feed_logs", Operation::Insert, json!({"id": 1}), 200);
        store.queue_add(&late).unwrap();
        store.queue_add(&early).unwrap();
        store.queue_add(&middle).unwrap();

        let ids: Vec<_> = store.queue_list(None).unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);

        let animals = store.queue_list(Some("animals")).unwrap();
        assert_eq!(animals.len(), 2);
        assert_eq!(animals[0], early);
    }

    #[test]
    fn equal_stamps_fall_back_to_insertion_order() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let first = item("animals", Operation::Insert, json!({"id": "x"}), 50);
        let second = item("animals", Operation::Delete, json!({"id": "x"}), 50);
        store.queue_add(&first).unwrap();
        store.queue_add(&second).unwrap();
        let listed = store.queue_list(None).unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[test]
    fn record_failure_and_delete_are_noops_for_missing_ids() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let ghost = QueueItemId::new();
        assert!(!store.queue_record_failure(ghost, "boom", Hlc::new(1, 0)).unwrap());
        assert!(!store.queue_delete(ghost).unwrap());
    }

    #[test]
    fn record_failure_bumps_retry_and_keeps_message() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let it = item("animals", Operation::Insert, json!({"id": "a"}), 10);
        store.queue_add(&it).unwrap();
        store.queue_record_failure(it.id, "timeout", Hlc::new(20, 0)).unwrap();
        store.queue_record_failure(it.id, "503", Hlc::new(30, 0)).unwrap();

        let stored = store.queue_get(it.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("503"));
        assert_eq!(stored.last_attempt_at, Some(Hlc::new(30, 0)));

        assert!(store.queue_reset_retries(it.id).unwrap());
        let reset = store.queue_get(it.id).unwrap().unwrap();
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_error.is_none());
    }

    #[test]
    fn counts_by_filter() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let a = item("animals", Operation::Insert, json!({"id": "a"}), 1);
        let b = item("feed_logs", Operation::Insert, json!({"id": "b"}), 2);
        store.queue_add(&a).unwrap();
        store.queue_add(&b).unwrap();
        for n in 0..5 {
            store.queue_record_failure(b.id, "nope", Hlc::new(10 + n, 0)).unwrap();
        }

        assert_eq!(store.queue_count(&QueueFilter::All).unwrap(), 2);
        assert_eq!(store.queue_count(&QueueFilter::Table("animals".into())).unwrap(), 1);
        assert_eq!(store.queue_count(&QueueFilter::Eligible { max_retries: 5 }).unwrap(), 1);
        assert_eq!(store.queue_count(&QueueFilter::Failed { max_retries: 5 }).unwrap(), 1);

        assert_eq!(store.queue_delete_failed(5).unwrap(), 1);
        assert_eq!(store.queue_count(&QueueFilter::All).unwrap(), 1);
    }

    #[test]
    fn max_created_at_tracks_newest_item() {
        let store = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(store.queue_max_created_at().unwrap(), None);
        store.queue_add(&item("animals", Operation::Insert, json!({"id": 1}), 70)).unwrap();
        store.queue_add(&item("animals", Operation::Insert, json!({"id": 2}), 90)).unwrap();
        assert_eq!(store.queue_max_created_at().unwrap(), Some(Hlc::new(90, 0)));
    }

    #[test]
    fn replace_collection_is_wholesale() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store
            .replace_collection("animals", &[row(json!({"id": "old"}))], 1)
            .unwrap();
        let stored = store
            .replace_collection(
                "animals",
                &[row(json!({"id": "n1"})), row(json!({"name": "no id"})), row(json!({"id": 2}))],
                2,
            )
            .unwrap();
        assert_eq!(stored, 2);
        assert!(store.get_row("animals", "old").unwrap().is_none());
        assert_eq!(store.rows("animals").unwrap().len(), 2);

        let manifest = store.cached_collections().unwrap();
        assert_eq!(
            manifest,
            vec![CollectionRecord {
                collection: "animals".into(),
                fetched_at: 2,
                row_count: 2,
            }]
        );
    }

    #[test]
    fn empty_collection_still_lands_in_manifest() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.replace_collection("vaccinations", &[], 5).unwrap();
        assert_eq!(store.cached_collections().unwrap().len(), 1);
        store.clear_collection("vaccinations").unwrap();
        assert!(store.cached_collections().unwrap().is_empty());
    }

    #[test]
    fn put_row_patches_in_place() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.put_row("animals", &row(json!({"id": "c", "pen": "A"}))).unwrap();
        store.put_row("animals", &row(json!({"id": "c", "pen": "B"}))).unwrap();
        let got = store.get_row("animals", "c").unwrap().unwrap();
        assert_eq!(got["pen"], json!("B"));
        assert_eq!(store.rows("animals").unwrap().len(), 1);

        assert!(matches!(
            store.put_row("animals", &row(json!({"pen": "C"}))),
            Err(StorageError::ConstraintViolation(_))
        ));

        assert!(store.delete_row("animals", "c").unwrap());
        assert!(!store.delete_row("animals", "c").unwrap());
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paddock.db");
        let path = path.to_str().unwrap();

        let payload = json!({"id": "br-1", "sire": "Ox"});
        let it = item("breeding_records", Operation::Insert, payload, 42);
        {
            let store = SqliteStorage::open(path).unwrap();
            store.queue_add(&it).unwrap();
        }
        let store = SqliteStorage::open(path).unwrap();
        assert_eq!(store.queue_list(None).unwrap(), vec![it]);
    }
}
