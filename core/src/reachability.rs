//! Connectivity signal supplied by the host platform.
//!
//! The engine does not test the network itself. The embedding application
//! (or the FFI layer) forwards the platform's reachability callbacks into
//! `set_reachable`, and the engine subscribes to the transitions.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Shared connectivity flag with change notification. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReachabilityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ReachabilityMonitor {
    pub fn new(reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(reachable);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current connectivity. Subscribers are notified only when
    /// the value actually changes.
    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if changed {
            info!(reachable, "connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
