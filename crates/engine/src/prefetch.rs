use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use paddock_core::{OfflineReadiness, PrefetchProgress, hlc::physical_now};
use paddock_storage::LocalStore;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::error::EngineError;
use crate::remote::RemoteStore;

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bulk-downloads remote collections into the local cache so the app can run
/// with no network at all.
pub struct PrefetchManager {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    collections: Vec<String>,
    required: Vec<String>,
    running: AtomicBool,
    progress: Arc<Broadcaster<PrefetchProgress>>,
    last_failures: Mutex<Vec<String>>,
}

impl PrefetchManager {
    /// `collections` are fetched in order; `required` is what readiness checks
    /// against.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        collections: Vec<String>,
        required: Vec<String>,
    ) -> Self {
        Self {
            store,
            remote,
            collections,
            required,
            running: AtomicBool::new(false),
            progress: Arc::new(Broadcaster::new(PrefetchProgress::default())),
            last_failures: Mutex::new(Vec::new()),
        }
    }

    pub fn progress(&self) -> &Arc<Broadcaster<PrefetchProgress>> {
        &self.progress
    }

    pub fn last_failures(&self) -> Vec<String> {
        self.last_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch every configured collection and overwrite its cached snapshot.
    /// Returns `Ok(true)` iff all of them made it. A second call while one is
    /// running is rejected with [`EngineError::PrefetchInProgress`].
    pub fn prefetch_all(&self) -> Result<bool, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::PrefetchInProgress);
        }
        let _guard = RunGuard(&self.running);

        self.progress
            .publish(PrefetchProgress::starting(self.collections.len()));

        let mut failures = Vec::new();
        for collection in &self.collections {
            self.progress
                .update(|p| p.current = Some(collection.clone()));

            if let Err(e) = self.fetch_one(collection) {
                warn!(collection = %collection, error = %e, "prefetch failed");
                failures.push(collection.clone());
            }

            self.progress.update(|p| p.completed += 1);
        }

        self.progress.update(|p| {
            p.current = None;
            p.is_complete = true;
        });

        let all_ok = failures.is_empty();
        info!(
            total = self.collections.len(),
            failed = failures.len(),
            "prefetch finished"
        );
        *self
            .last_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = failures;
        Ok(all_ok)
    }

    fn fetch_one(&self, collection: &str) -> Result<(), EngineError> {
        let rows = self.remote.select_all(collection)?;
        let fetched_at = physical_now()?;
        let stored = self.store.replace_collection(collection, &rows, fetched_at)?;
        info!(collection, fetched = rows.len(), stored, "collection cached");
        Ok(())
    }

    /// Read-only: which required collections have no cached snapshot.
    pub fn check_offline_readiness(&self) -> Result<OfflineReadiness, EngineError> {
        let cached: BTreeSet<String> = self
            .store
            .cached_collections()?
            .into_iter()
            .map(|r| r.collection)
            .collect();

        let missing_data: Vec<String> = self
            .required
            .iter()
            .filter(|c| !cached.contains(c.as_str()))
            .cloned()
            .collect();

        Ok(OfflineReadiness {
            is_ready: missing_data.is_empty(),
            missing_data,
        })
    }
}
