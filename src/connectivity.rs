//! Online/offline signal feeding the background sync driver.
//!
//! The host app forwards OS/browser connectivity events through
//! `set_online`; `spawn_health_monitor` can drive the same signal from a
//! periodic reachability probe against the admin dashboard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::AdminClient;

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
    /// Offline-to-online transitions so far. The watch value alone can hide
    /// a quick flap between two reads.
    restored: Arc<AtomicU64>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            tx: Arc::new(tx),
            restored: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish the current state; subscribers only wake on actual changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                if online {
                    // Bumped before subscribers are notified.
                    self.restored.fetch_add(1, Ordering::SeqCst);
                }
                true
            }
        });
        if changed {
            if online {
                info!("Network restored; resuming queued sync");
            } else {
                info!("Network offline; deferring remote sync and keeping queue pending");
            }
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn restored_count(&self) -> u64 {
        self.restored.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Probe `/api/health` every `interval` and publish the result until
/// `shutdown` fires.
pub fn spawn_health_monitor(
    connectivity: Connectivity,
    client: Arc<AdminClient>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let online = client.check_health().await;
                    connectivity.set_online(online);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_transitions_only() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(true);
        assert!(rx.has_changed().unwrap());
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn quick_flap_is_still_counted() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        connectivity.set_online(true);

        // The receiver only sees the final value, unchanged from the start.
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert_eq!(connectivity.restored_count(), 1);

        connectivity.set_online(true);
        assert_eq!(connectivity.restored_count(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = Connectivity::new(true);
        let b = a.clone();
        b.set_online(false);
        assert!(!a.is_online());
    }
}
