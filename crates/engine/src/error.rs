use paddock_core::CoreError;
use paddock_storage::StorageError;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("prefetch already in progress")]
    PrefetchInProgress,

    #[error("{operation} on {table} has no entity id")]
    MissingEntityId {
        table: String,
        operation: &'static str,
    },

    #[error("config error: {0}")]
    Config(String),
}
