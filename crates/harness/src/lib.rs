pub mod remote;
pub mod store;

pub use remote::{GateHandle, RemoteCall, ScriptedRemote};
pub use store::{FlakyStore, SwitchProbe};

use std::sync::Arc;

use paddock_core::Row;
use paddock_engine::{
    ConnectivityMonitor, EngineError, MutationQueue, OfflineWriter, PrefetchManager, RetryPolicy,
    SyncEngine,
};
use paddock_storage::LocalStore;
use serde_json::Value;

/// Build a row from a JSON object literal. Anything else yields an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Route `tracing` output through the test writer. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("paddock_engine=debug,paddock_storage=debug")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// One simulated device: a flaky local store, a scripted backend, a
/// connectivity switch and the engine wired over them.
pub struct TestRig {
    pub remote: Arc<ScriptedRemote>,
    pub store: Arc<FlakyStore>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub engine: Arc<SyncEngine>,
    pub writer: OfflineWriter,
}

impl TestRig {
    /// Online device with the default retry policy.
    pub fn new() -> Result<Self, EngineError> {
        Self::with_policy(true, RetryPolicy::default())
    }

    pub fn offline() -> Result<Self, EngineError> {
        Self::with_policy(false, RetryPolicy::default())
    }

    pub fn with_policy(online: bool, policy: RetryPolicy) -> Result<Self, EngineError> {
        init_tracing();
        let store = Arc::new(FlakyStore::new()?);
        let remote = ScriptedRemote::new();
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let queue = Arc::new(MutationQueue::new(Arc::clone(&store) as Arc<dyn LocalStore>)?);
        let engine = Arc::new(SyncEngine::new(
            queue,
            Arc::clone(&remote) as _,
            Arc::clone(&monitor),
            policy,
        ));
        let writer = OfflineWriter::new(Arc::clone(&engine));
        Ok(Self {
            remote,
            store,
            monitor,
            engine,
            writer,
        })
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        self.engine.queue()
    }

    pub fn go_offline(&self) {
        self.monitor.report(false);
    }

    pub fn go_online(&self) {
        self.monitor.report(true);
    }

    pub fn pending(&self) -> u64 {
        self.engine.status().current().pending_count
    }

    /// A prefetcher over this rig's store and backend.
    pub fn prefetcher(&self, collections: &[&str], required: &[&str]) -> PrefetchManager {
        PrefetchManager::new(
            Arc::clone(&self.store) as _,
            Arc::clone(&self.remote) as _,
            collections.iter().map(|c| c.to_string()).collect(),
            required.iter().map(|c| c.to_string()).collect(),
        )
    }
}
