pub mod error;
pub mod hlc;
pub mod ids;
pub mod queue_item;
pub mod row;
pub mod status;

pub use error::CoreError;
pub use hlc::{Hlc, HlcClock};
pub use ids::*;
pub use queue_item::{Operation, QueueItem};
pub use row::Row;
pub use status::{OfflineReadiness, PrefetchProgress, SyncStatus};
