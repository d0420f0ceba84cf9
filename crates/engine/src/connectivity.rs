use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::broadcast::{ListenerSet, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

/// Host-provided reachability check (platform network API, a HEAD request
/// against the backend, ...).
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// Tracks whether the device can reach the network and announces
/// transitions. Repeated reports of the same state are swallowed.
///
/// Reports are serialized: a transition is fully announced before the next
/// report is applied, so listeners see transitions in the order the state
/// actually changed. A listener must not call `report` itself.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    listeners: ListenerSet<Transition>,
    reporting: Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: AtomicBool::new(initially_online),
            listeners: ListenerSet::new(),
            reporting: Mutex::new(()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Feed the current platform signal in. Listeners run on the calling
    /// thread, only when the state actually flips.
    pub fn report(&self, online: bool) -> Option<Transition> {
        let _reporting = self.reporting.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.online.swap(online, Ordering::AcqRel);
        if previous == online {
            return None;
        }

        let transition = if online {
            Transition::CameOnline
        } else {
            Transition::WentOffline
        };
        info!(?transition, "connectivity changed");
        self.listeners.notify(&transition);
        Some(transition)
    }

    pub fn refresh(&self, probe: &dyn ReachabilityProbe) -> Option<Transition> {
        self.report(probe.is_reachable())
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
