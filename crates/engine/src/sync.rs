use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use paddock_core::{Operation, QueueItem, SyncStatus, hlc::physical_now, row};
use paddock_storage::QueueFilter;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, Subscription};
use crate::connectivity::{ConnectivityMonitor, Transition};
use crate::error::EngineError;
use crate::queue::MutationQueue;
use crate::remote::RemoteStore;

pub const MAX_RETRIES: u32 = 5;

/// Per-item retry budget, plus optional exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Zero disables backoff: every drain attempts every eligible item.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_base: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `retry_count`-th failure: `base * 2^(n-1)` stretched by
    /// up to 25% jitter. The jitter is seeded from the item id so repeated
    /// checks of the same item agree.
    pub fn backoff_for(&self, item: &QueueItem) -> Duration {
        if self.backoff_base.is_zero() || item.retry_count == 0 {
            return Duration::ZERO;
        }
        let exp = item.retry_count.saturating_sub(1).min(16);
        let base = self.backoff_base.saturating_mul(1u32 << exp);

        let mut seed = [0u8; 8];
        seed.copy_from_slice(&item.id.as_bytes()[8..]);
        let seed = u64::from_le_bytes(seed) ^ u64::from(item.retry_count);
        let mut rng = StdRng::seed_from_u64(seed);
        base.mul_f64(1.0 + rng.gen_range(0.0..0.25))
    }

    fn is_deferred(&self, item: &QueueItem, now_ms: u64) -> bool {
        let Some(last) = item.last_attempt_at else {
            return false;
        };
        let wait = self.backoff_for(item).as_millis() as u64;
        wait > 0 && now_ms < last.wall_ms().saturating_add(wait)
    }
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub success: usize,
    pub failed: usize,
    /// Eligible items left alone because their backoff window is still open.
    pub deferred: usize,
}

/// Clears the single-flight flag even if a remote call panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays the mutation queue against the remote store.
///
/// At most one drain runs at a time; overlapping requests return an empty
/// report without touching the queue. Remote failures never escape
/// `process_queue`: they are recorded on the item and in the broadcast status.
pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    policy: RetryPolicy,
    syncing: AtomicBool,
    status: Arc<Broadcaster<SyncStatus>>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
        policy: RetryPolicy,
    ) -> Self {
        let pending_count = queue.count(&QueueFilter::All).unwrap_or_else(|e| {
            warn!(error = %e, "could not count queued mutations at startup");
            0
        });
        Self {
            queue,
            remote,
            connectivity,
            policy,
            syncing: AtomicBool::new(false),
            status: Arc::new(Broadcaster::new(SyncStatus {
                pending_count,
                ..SyncStatus::default()
            })),
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// The status observable to hand to presentation code.
    pub fn status(&self) -> &Arc<Broadcaster<SyncStatus>> {
        &self.status
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Drain automatically whenever the device comes back online. The engine
    /// is held weakly; dropping the returned handle detaches it.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let engine: Weak<Self> = Arc::downgrade(self);
        self.connectivity.subscribe(move |transition| {
            if *transition != Transition::CameOnline {
                return;
            }
            if let Some(engine) = engine.upgrade() {
                let report = engine.process_queue();
                debug!(?report, "drain after reconnect");
            }
        })
    }

    /// Recompute `pending_count` and broadcast it, e.g. after an enqueue.
    pub fn refresh_status(&self) -> Result<SyncStatus, EngineError> {
        let pending = self.queue.count(&QueueFilter::All)?;
        Ok(self.status.update(|s| s.pending_count = pending))
    }

    pub fn process_queue(&self) -> DrainReport {
        if !self.connectivity.is_online() {
            debug!("offline, drain skipped");
            return DrainReport::default();
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain already in progress");
            return DrainReport::default();
        }
        let _guard = DrainGuard(&self.syncing);

        self.status.update(|s| {
            s.is_syncing = true;
            s.last_error = None;
        });

        let (report, last_error) = self.drain();

        let pending = match self.queue.count(&QueueFilter::All) {
            Ok(n) => Some(n),
            Err(e) => {
                error!(error = %e, "could not recount queue after drain");
                None
            }
        };
        let finished_at = physical_now().ok();
        self.status.update(|s| {
            s.is_syncing = false;
            s.last_sync_at = finished_at;
            s.last_error = last_error;
            if let Some(pending) = pending {
                s.pending_count = pending;
            }
        });

        info!(
            success = report.success,
            failed = report.failed,
            deferred = report.deferred,
            "drain finished"
        );
        report
    }

    fn drain(&self) -> (DrainReport, Option<String>) {
        let mut report = DrainReport::default();
        let mut last_error = None;

        let items = match self.queue.list_pending(None) {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "could not read mutation queue");
                return (report, Some(e.to_string()));
            }
        };
        info!(items = items.len(), "drain started");
        let now_ms = physical_now().unwrap_or(0);

        for listed in items {
            if listed.is_exhausted(self.policy.max_retries) {
                debug!(
                    id = %listed.id,
                    retries = listed.retry_count,
                    "retry budget spent, skipping"
                );
                report.failed += 1;
                continue;
            }
            if self.policy.is_deferred(&listed, now_ms) {
                report.deferred += 1;
                continue;
            }

            let item = match self.queue.begin_dispatch(listed.id) {
                Ok(Some(item)) => item,
                Ok(None) => {
                    debug!(id = %listed.id, "item removed before replay");
                    continue;
                }
                Err(e) => {
                    error!(id = %listed.id, error = %e, "could not re-read queued item");
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            match self.replay(&item) {
                Ok(()) => {
                    report.success += 1;
                    if let Err(e) = self.queue.finish_dispatch(item.id, None) {
                        error!(id = %item.id, error = %e, "applied remotely but still queued");
                        last_error = Some(e.to_string());
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        id = %item.id,
                        table = %item.table,
                        op = item.operation.as_str(),
                        retry = item.retry_count + 1,
                        error = %message,
                        "replay failed"
                    );
                    if let Err(se) = self.queue.finish_dispatch(item.id, Some(&message)) {
                        error!(id = %item.id, error = %se, "could not record replay failure");
                    }
                    report.failed += 1;
                    last_error = Some(message);
                }
            }
        }

        (report, last_error)
    }

    fn replay(&self, item: &QueueItem) -> Result<(), EngineError> {
        match item.operation {
            Operation::Insert => self.remote.insert(&item.table, &item.payload)?,
            Operation::Update => {
                let id = self.require_id(item)?;
                self.remote
                    .update(&item.table, id, &row::without_id(&item.payload))?
            }
            Operation::Delete => {
                let id = self.require_id(item)?;
                self.remote.delete(&item.table, id)?
            }
        }
        Ok(())
    }

    fn require_id<'a>(&self, item: &'a QueueItem) -> Result<&'a serde_json::Value, EngineError> {
        row::entity_id(&item.payload).ok_or_else(|| EngineError::MissingEntityId {
            table: item.table.clone(),
            operation: item.operation.as_str(),
        })
    }
}
