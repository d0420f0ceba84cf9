use serde::{Deserialize, Serialize};

/// Process-wide view of the sync layer, as broadcast to presentation code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub pending_count: u64,
    /// Milliseconds since Unix epoch of the last finished drain.
    pub last_sync_at: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchProgress {
    pub completed: usize,
    pub total: usize,
    /// Label of the collection currently in flight.
    pub current: Option<String>,
    pub is_complete: bool,
}

impl PrefetchProgress {
    pub fn starting(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            current: None,
            is_complete: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineReadiness {
    pub is_ready: bool,
    pub missing_data: Vec<String>,
}
