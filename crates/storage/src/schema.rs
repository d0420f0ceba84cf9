use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -8000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id BLOB NOT NULL UNIQUE CHECK (length(queue_id) = 16),
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
    payload BLOB NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    last_error TEXT,
    created_at BLOB NOT NULL CHECK (length(created_at) = 12),
    last_attempt_at BLOB CHECK (last_attempt_at IS NULL OR length(last_attempt_at) = 12)
);
CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue (created_at, seq);
CREATE INDEX IF NOT EXISTS idx_sync_queue_table ON sync_queue (table_name, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_sync_queue_retry ON sync_queue (retry_count);

CREATE TABLE IF NOT EXISTS cache_rows (
    collection TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    row BLOB NOT NULL,
    PRIMARY KEY (collection, entity_key)
);

CREATE TABLE IF NOT EXISTS cache_manifest (
    collection TEXT PRIMARY KEY,
    fetched_at INTEGER NOT NULL,
    row_count INTEGER NOT NULL
);
";
