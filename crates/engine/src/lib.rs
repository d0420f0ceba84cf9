pub mod broadcast;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod merge;
pub mod prefetch;
pub mod queue;
pub mod remote;
pub mod sync;
pub mod writer;

pub use broadcast::{Broadcaster, Subscription};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ReachabilityProbe, Transition};
pub use error::EngineError;
pub use merge::{MergedRow, RowOrigin, merge_pending};
pub use prefetch::PrefetchManager;
pub use queue::MutationQueue;
pub use remote::{RemoteError, RemoteStore};
pub use sync::{DrainReport, MAX_RETRIES, RetryPolicy, SyncEngine};
pub use writer::{OfflineWriter, WriteOutcome};

use std::sync::Arc;

use paddock_core::{PrefetchProgress, SyncStatus};
use paddock_storage::{LocalStore, SqliteStorage};
use tracing::info;

/// The whole offline layer, wired together from one config.
///
/// Owns the auto-sync subscription: while this value is alive, every
/// offline-to-online transition on `connectivity` triggers a drain.
pub struct OfflineSync {
    engine: Arc<SyncEngine>,
    prefetch: PrefetchManager,
    writer: OfflineWriter,
    _auto_sync: Subscription,
}

impl OfflineSync {
    /// Open (or create) the SQLite store named in `config` and wire the layer.
    pub fn open(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Result<Self, EngineError> {
        let path = config.database_path.to_string_lossy();
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStorage::open(&path)?);
        info!(path = %path, "opened local store");
        Self::with_store(config, store, remote, connectivity)
    }

    pub fn with_store(
        config: &SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Result<Self, EngineError> {
        let queue = Arc::new(MutationQueue::new(Arc::clone(&store))?);
        let engine = Arc::new(SyncEngine::new(
            queue,
            Arc::clone(&remote),
            connectivity,
            config.retry_policy(),
        ));
        let prefetch = PrefetchManager::new(
            store,
            remote,
            config.prefetch_collections.clone(),
            config.required().to_vec(),
        );
        let writer = OfflineWriter::new(Arc::clone(&engine));
        let auto_sync = engine.attach();

        Ok(Self {
            engine,
            prefetch,
            writer,
            _auto_sync: auto_sync,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        self.engine.queue()
    }

    pub fn prefetch(&self) -> &PrefetchManager {
        &self.prefetch
    }

    pub fn writer(&self) -> &OfflineWriter {
        &self.writer
    }

    pub fn status(&self) -> &Arc<Broadcaster<SyncStatus>> {
        self.engine.status()
    }

    pub fn prefetch_progress(&self) -> &Arc<Broadcaster<PrefetchProgress>> {
        self.prefetch.progress()
    }

    pub fn process_queue(&self) -> DrainReport {
        self.engine.process_queue()
    }

    /// Cached rows for `table` merged with its unsynced mutations.
    pub fn optimistic_rows(&self, table: &str) -> Result<Vec<MergedRow>, EngineError> {
        let server = self.queue().store().rows(table)?;
        let pending = self.queue().list_pending(Some(table))?;
        Ok(merge_pending(&server, &pending))
    }
}
