use paddock_core::Row;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by the hosted backend.
///
/// The sync engine treats every error the same way (one retry spent). The
/// offline writer uses `transient` to decide between queueing a direct write
/// and reporting it back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub transient: bool,
}

impl RemoteError {
    /// Network trouble, timeouts, 5xx: worth retrying later.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// The backend looked at the row and refused it.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Client for the hosted relational backend, one call per collection
/// operation. Timeouts are the implementation's business and surface as
/// errors.
pub trait RemoteStore: Send + Sync {
    fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError>;

    fn update(&self, table: &str, id: &Value, patch: &Row) -> Result<(), RemoteError>;

    fn delete(&self, table: &str, id: &Value) -> Result<(), RemoteError>;

    fn select_all(&self, table: &str) -> Result<Vec<Row>, RemoteError>;
}
