//! Background sync engine.
//!
//! Delivers locally accepted orders to the admin dashboard. Each order is
//! pushed with its idempotency key, so a repeated attempt is safe on the
//! server side; locally, an in-flight set and a `synced` check before every
//! attempt keep racing triggers (timer, connectivity restored, manual) from
//! pushing the same order twice.
//!
//! Failed attempts stay queued with capped exponential backoff. Once an entry
//! has used up `max_attempts` the timer leaves it alone, but it is never
//! dropped: connectivity-restored and manual cycles still retry it, and it is
//! reported as `exhausted` in `SyncStatus`.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::db::{self, DbState};
use crate::error::{PosError, Result, SyncError};
use crate::optimistic::OptimisticAction;
use crate::orders::{self, Order, OrderStatus, QueueEntry};

// ---------------------------------------------------------------------------
// Remote endpoint
// ---------------------------------------------------------------------------

/// Acknowledgement from the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncAck {
    pub remote_id: Option<String>,
    /// The dashboard already held an order under this idempotency key.
    pub duplicate: bool,
}

/// Remote order sink. Implementations must treat a repeated
/// `idempotency_key` as the same order.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    async fn push_order(&self, payload: &Value, idempotency_key: &str) -> std::result::Result<SyncAck, SyncError>;

    async fn push_status(&self, order_id: &str, status: OrderStatus) -> std::result::Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// Outcomes and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { failed_attempts: u32, duplicate: bool },
    AlreadySynced,
    /// Another attempt for the same order is running.
    InFlight,
    Failed {
        retry_count: u32,
        exhausted: bool,
        error: SyncError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Timer,
    ConnectivityRestored,
    Manual,
}

impl SyncTrigger {
    fn as_str(self) -> &'static str {
        match self {
            SyncTrigger::Timer => "timer",
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Snapshot for the UI's pending-sync badge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending: usize,
    /// Entries past the retry budget; still queued.
    pub exhausted: usize,
    pub last_sync: Option<String>,
    pub last_error: Option<String>,
}

/// Removes the order id from the in-flight set when the attempt ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    order_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, order_id: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(order_id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            order_id: order_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.order_id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<DbState>,
    endpoint: Arc<dyn SyncEndpoint>,
    config: SyncConfig,
    in_flight: Mutex<HashSet<String>>,
    last_sync: Mutex<Option<String>>,
}

impl SyncEngine {
    pub fn new(db: Arc<DbState>, endpoint: Arc<dyn SyncEndpoint>, config: SyncConfig) -> Self {
        Self {
            db,
            endpoint,
            config,
            in_flight: Mutex::new(HashSet::new()),
            last_sync: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Attempt delivery of one order.
    ///
    /// Network failures are not errors here: they come back as
    /// `SyncOutcome::Failed` with the queue entry rescheduled. `Err` means the
    /// local database could not be read or written.
    pub async fn sync_order(&self, order_id: &str) -> Result<SyncOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, order_id) else {
            debug!(order_id = %order_id, "Sync already in flight, skipping duplicate attempt");
            return Ok(SyncOutcome::InFlight);
        };

        let (order, entry) = {
            let conn = self.db.lock()?;
            let order = orders::load_order(&conn, order_id)?
                .ok_or_else(|| PosError::NotFound(format!("order {order_id}")))?;
            if order.synced {
                return Ok(SyncOutcome::AlreadySynced);
            }
            let entry = orders::load_queue_entry(&conn, order_id)?.ok_or_else(|| {
                PosError::Storage(format!("unsynced order {order_id} has no queue entry"))
            })?;
            (order, entry)
        };

        let payload = serde_json::to_value(&order)?;
        match self.endpoint.push_order(&payload, &order.idempotency_key).await {
            Ok(ack) => {
                let changed_status = self.mark_synced(&order, &entry)?;
                info!(
                    order_id = %order_id,
                    failed_attempts = entry.retry_count,
                    duplicate = ack.duplicate,
                    remote_id = ?ack.remote_id,
                    "Order synced"
                );
                if let Some(status) = changed_status {
                    self.forward_status_change(order_id, status).await;
                }
                Ok(SyncOutcome::Synced {
                    failed_attempts: entry.retry_count,
                    duplicate: ack.duplicate,
                })
            }
            Err(error) => {
                let retry_count = self.record_failure(&entry, &error)?;
                let exhausted = retry_count >= self.config.max_attempts;
                if exhausted {
                    warn!(
                        order_id = %order_id,
                        retry_count,
                        error = %error,
                        "Order sync retry budget exhausted; keeping it queued as pending"
                    );
                } else {
                    warn!(order_id = %order_id, retry_count, error = %error, "Order sync failed");
                }
                Ok(SyncOutcome::Failed {
                    retry_count,
                    exhausted,
                    error,
                })
            }
        }
    }

    /// Flip the order to synced and drop its queue entry in one transaction.
    ///
    /// `order` is the snapshot that was pushed. If the kitchen moved the order
    /// on while the push was in flight, that newer status is kept and
    /// returned so it can be forwarded to the dashboard.
    fn mark_synced(&self, order: &Order, entry: &QueueEntry) -> Result<Option<OrderStatus>> {
        let now = db::now();
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let current = orders::load_order(&tx, &order.id)?
            .ok_or_else(|| PosError::NotFound(format!("order {}", order.id)))?
            .status;
        let changed = (current != order.status).then_some(current);
        let status = changed.unwrap_or(OrderStatus::Synced);

        tx.execute(
            "UPDATE orders
             SET synced = 1, status = ?1, sync_failures = ?2, synced_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), entry.retry_count, &now, &order.id],
        )?;
        tx.execute("DELETE FROM sync_queue WHERE order_id = ?1", params![&order.id])?;
        tx.commit()?;

        let mut last = self.last_sync.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(now);
        Ok(changed)
    }

    /// Push a status change that happened after the payload snapshot.
    async fn forward_status_change(&self, order_id: &str, status: OrderStatus) {
        match self.endpoint.push_status(order_id, status).await {
            Ok(()) => info!(order_id = %order_id, status = %status, "Forwarded status changed during sync"),
            Err(e) => warn!(
                order_id = %order_id,
                status = %status,
                error = %e,
                "Failed to forward status changed during sync"
            ),
        }
    }

    /// Bump the retry count and schedule the next timer attempt. Returns the
    /// new retry count.
    ///
    /// A non-transient failure (payload rejected, credentials refused) will
    /// not heal on the timer, so the count jumps straight to `max_attempts`.
    /// The entry stays queued for connectivity-restored and manual cycles.
    fn record_failure(&self, entry: &QueueEntry, error: &SyncError) -> Result<u32> {
        let delay = self.config.backoff_delay(entry.retry_count);
        let delay = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::weeks(1));
        let next_retry_at = Utc::now()
            .checked_add_signed(delay)
            .map(db::timestamp)
            .unwrap_or_else(db::now);
        let floor = if error.is_transient() {
            0
        } else {
            self.config.max_attempts
        };

        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE sync_queue
             SET retry_count = MAX(retry_count + 1, ?1), last_error = ?2, next_retry_at = ?3,
                 updated_at = ?4
             WHERE order_id = ?5",
            params![
                floor,
                error.to_string(),
                &next_retry_at,
                db::now(),
                &entry.order_id
            ],
        )?;
        let retry_count: u32 = conn.query_row(
            "SELECT retry_count FROM sync_queue WHERE order_id = ?1",
            params![&entry.order_id],
            |row| row.get(0),
        )?;
        Ok(retry_count)
    }

    /// Queue entries a cycle should attempt for `trigger`.
    fn due_entries(&self, trigger: SyncTrigger) -> Result<Vec<QueueEntry>> {
        let entries = {
            let conn = self.db.lock()?;
            orders::load_queue(&conn)?
        };
        if trigger != SyncTrigger::Timer {
            return Ok(entries);
        }

        let now = db::now();
        Ok(entries
            .into_iter()
            .filter(|e| e.retry_count < self.config.max_attempts)
            .filter(|e| e.next_retry_at.as_deref().map_or(true, |at| at <= now.as_str()))
            .collect())
    }

    /// Process queued orders one after another.
    pub async fn run_sync_cycle(&self, trigger: SyncTrigger) -> Result<CycleReport> {
        let entries = self.due_entries(trigger)?;
        let mut report = CycleReport::default();

        for entry in entries {
            report.attempted += 1;
            match self.sync_order(&entry.order_id).await {
                Ok(SyncOutcome::Synced { .. }) => report.synced += 1,
                Ok(SyncOutcome::Failed { .. }) => report.failed += 1,
                Ok(SyncOutcome::AlreadySynced | SyncOutcome::InFlight) => report.skipped += 1,
                Err(e) => {
                    warn!(order_id = %entry.order_id, error = %e, "Sync attempt aborted");
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                trigger = trigger.as_str(),
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                "Sync cycle complete"
            );
        }
        Ok(report)
    }

    pub fn status(&self, is_online: bool) -> Result<SyncStatus> {
        let entries = {
            let conn = self.db.lock()?;
            orders::load_queue(&conn)?
        };
        let exhausted = entries
            .iter()
            .filter(|e| e.retry_count >= self.config.max_attempts)
            .count();
        let last_error = entries.iter().rev().find_map(|e| e.last_error.clone());
        let last_sync = self
            .last_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        Ok(SyncStatus {
            is_online,
            pending: entries.len(),
            exhausted,
            last_sync,
            last_error,
        })
    }

    /// Kitchen status change that the dashboard should see.
    ///
    /// Unsynced orders only change locally; the queued payload is read at
    /// delivery time and carries the new status. Synced orders are updated
    /// optimistically and reverted if the dashboard rejects the change.
    pub async fn push_status_update(&self, order_id: &str, status: OrderStatus) -> Result<Order> {
        let order = {
            let conn = self.db.lock()?;
            orders::load_order(&conn, order_id)?
                .ok_or_else(|| PosError::NotFound(format!("order {order_id}")))?
        };
        if !order.status.can_transition_to(status) {
            return Err(PosError::Validation(format!(
                "cannot move order from {} to {}",
                order.status, status
            )));
        }

        if order.synced {
            let db = &self.db;
            OptimisticAction::new(
                "order_status",
                || {
                    let conn = db.lock()?;
                    orders::write_status(&conn, order_id, status)
                },
                |previous| {
                    let conn = db.lock()?;
                    orders::write_status(&conn, order_id, previous).map(|_| ())
                },
            )
            .run(async {
                self.endpoint
                    .push_status(order_id, status)
                    .await
                    .map_err(PosError::from)
            })
            .await?;
        } else {
            let conn = self.db.lock()?;
            orders::write_status(&conn, order_id, status)?;
        }

        let conn = self.db.lock()?;
        orders::load_order(&conn, order_id)?
            .ok_or_else(|| PosError::NotFound(format!("order {order_id}")))
    }
}

// ---------------------------------------------------------------------------
// Background driver
// ---------------------------------------------------------------------------

/// Owns the background task that runs sync cycles.
pub struct SyncDriver {
    shutdown: CancellationToken,
    force: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    status_rx: watch::Receiver<SyncStatus>,
    handle: JoinHandle<()>,
}

impl SyncDriver {
    /// Spawn the loop on the current tokio runtime. Cycles run on every timer
    /// tick while online, on every offline-to-online transition, and on
    /// `force_sync`.
    pub fn start(engine: Arc<SyncEngine>, connectivity: Connectivity) -> Self {
        let shutdown = CancellationToken::new();
        let force = Arc::new(Notify::new());
        let is_running = Arc::new(AtomicBool::new(true));

        let initial = engine
            .status(connectivity.is_online())
            .unwrap_or_else(|_| SyncStatus::default());
        let (status_tx, status_rx) = watch::channel(initial);
        let link = LinkWatch::new(connectivity);

        let handle = tokio::spawn(run_loop(
            engine,
            link,
            shutdown.clone(),
            force.clone(),
            is_running.clone(),
            status_tx,
        ));

        Self {
            shutdown,
            force,
            is_running,
            status_rx,
            handle,
        }
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Request an immediate cycle, covering exhausted entries too.
    pub fn force_sync(&self) {
        self.force.notify_one();
    }

    /// Stop the loop. A cycle already underway finishes first; no request is
    /// aborted mid-flight.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sync loop task ended abnormally");
        }
    }
}

/// Connectivity as seen by the loop. Subscribed when the driver starts so
/// transitions made before the task first runs are not missed.
struct LinkWatch {
    connectivity: Connectivity,
    rx: watch::Receiver<bool>,
    was_online: bool,
    seen_restored: u64,
}

impl LinkWatch {
    fn new(connectivity: Connectivity) -> Self {
        let mut rx = connectivity.subscribe();
        let was_online = *rx.borrow_and_update();
        let seen_restored = connectivity.restored_count();
        Self {
            connectivity,
            rx,
            was_online,
            seen_restored,
        }
    }

    /// Consume a connectivity change. True when the link came back since the
    /// last look, even if it dropped and returned between two polls.
    fn observe(&mut self) -> bool {
        let online = *self.rx.borrow_and_update();
        let restored = self.connectivity.restored_count();
        let reconnected = restored != self.seen_restored;
        self.seen_restored = restored;
        self.was_online = online;
        online && reconnected
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    mut link: LinkWatch,
    shutdown: CancellationToken,
    force: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    status_tx: watch::Sender<SyncStatus>,
) {
    let interval = engine.config().interval;
    info!("Sync loop started (interval: {}s)", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip immediate tick

    loop {
        let trigger = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            changed = link.rx.changed() => {
                if changed.is_err() {
                    break;
                }
                link.observe().then_some(SyncTrigger::ConnectivityRestored)
            }

            _ = force.notified() => Some(SyncTrigger::Manual),

            _ = ticker.tick() => link.was_online.then_some(SyncTrigger::Timer),
        };

        if let Some(trigger) = trigger {
            if let Err(e) = engine.run_sync_cycle(trigger).await {
                warn!("Sync cycle failed: {e}");
            }
        }

        match engine.status(link.connectivity.is_online()) {
            Ok(status) => {
                status_tx.send_replace(status);
            }
            Err(e) => warn!("Failed to read sync status: {e}"),
        }
    }

    is_running.store(false, Ordering::SeqCst);
    info!("Sync loop stopped");
}


#[cfg(test)]
mod tests {
    use super::test_support::MockEndpoint;
    use super::*;
    use crate::orders::{sample_order, OrderStore};
    use std::time::Duration;

    fn setup(endpoint: MockEndpoint, config: SyncConfig) -> (OrderStore, Arc<SyncEngine>, Arc<MockEndpoint>) {
        let db = Arc::new(db::test_db());
        let endpoint = Arc::new(endpoint);
        let engine = Arc::new(SyncEngine::new(db.clone(), endpoint.clone(), config));
        (OrderStore::new(db), engine, endpoint)
    }

    fn immediate_retries() -> SyncConfig {
        SyncConfig {
            base_delay: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    /// Queue entry iff not synced, for every order.
    fn assert_queue_invariant(store: &OrderStore) {
        let queued: HashSet<String> = store
            .list_queue()
            .unwrap()
            .into_iter()
            .map(|e| e.order_id)
            .collect();
        for order in store.list_orders().unwrap() {
            assert_eq!(queued.contains(&order.id), !order.synced, "order {}", order.id);
        }
    }

    #[tokio::test]
    async fn sync_marks_order_and_clears_queue() {
        let (store, engine, endpoint) = setup(MockEndpoint::default(), SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();
        assert_queue_invariant(&store);

        let outcome = engine.sync_order(&order.id).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                failed_attempts: 0,
                duplicate: false
            }
        );

        let synced = store.get_order(&order.id).unwrap();
        assert!(synced.synced);
        assert_eq!(synced.status, OrderStatus::Synced);
        assert!(synced.synced_at.is_some());
        assert_eq!(store.pending_sync_count().unwrap(), 0);
        assert_eq!(endpoint.remote_orders(), 1);
        assert_queue_invariant(&store);

        let payload = endpoint.created.lock().unwrap().values().next().cloned().unwrap();
        assert_eq!(payload["id"], Value::String(order.id.clone()));
        assert_eq!(payload["total"], Value::from(3500));
    }

    #[tokio::test]
    async fn repeated_sync_creates_one_remote_order() {
        let (store, engine, endpoint) = setup(MockEndpoint::default(), SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        engine.sync_order(&order.id).await.unwrap();
        let again = engine.sync_order(&order.id).await.unwrap();

        assert_eq!(again, SyncOutcome::AlreadySynced);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.remote_orders(), 1);
    }

    #[tokio::test]
    async fn racing_triggers_do_not_double_submit() {
        let endpoint = MockEndpoint {
            delay: Duration::from_millis(50),
            ..MockEndpoint::default()
        };
        let (store, engine, endpoint) = setup(endpoint, SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        let (timer, restored) = tokio::join!(
            engine.run_sync_cycle(SyncTrigger::Timer),
            engine.run_sync_cycle(SyncTrigger::ConnectivityRestored),
        );
        let (timer, restored) = (timer.unwrap(), restored.unwrap());

        assert_eq!(timer.synced + restored.synced, 1);
        assert_eq!(timer.skipped + restored.skipped, 1);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.remote_orders(), 1);
        assert!(store.get_order(&order.id).unwrap().synced);
        assert_queue_invariant(&store);
    }

    #[tokio::test]
    async fn failures_then_success_record_attempts() {
        let (store, engine, _endpoint) = setup(MockEndpoint::failing(3), immediate_retries());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        for expected in 1..=3 {
            let report = engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
            assert_eq!(report.failed, 1);
            let entry = &store.list_queue().unwrap()[0];
            assert_eq!(entry.retry_count, expected);
            assert!(entry.last_error.as_deref().unwrap().contains("Cannot reach"));
            assert_queue_invariant(&store);
        }

        let report = engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
        assert_eq!(report.synced, 1);

        let synced = store.get_order(&order.id).unwrap();
        assert!(synced.synced);
        assert_eq!(synced.status, OrderStatus::Synced);
        assert_eq!(synced.sync_failures, 3);
        assert_eq!(store.pending_sync_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn timer_waits_for_backoff() {
        let (store, engine, endpoint) = setup(MockEndpoint::failing(1), SyncConfig::default());
        store.submit_order(sample_order("store-1")).unwrap();

        let first = engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
        assert_eq!(first.failed, 1);

        let entry = &store.list_queue().unwrap()[0];
        let next = entry.next_retry_at.clone().unwrap();
        assert!(next > db::now());

        // Not due yet: the timer skips it, a manual cycle does not.
        let second = engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
        assert_eq!(second.attempted, 0);
        let manual = engine.run_sync_cycle(SyncTrigger::Manual).await.unwrap();
        assert_eq!(manual.synced, 1);
        assert_eq!(endpoint.remote_orders(), 1);
    }

    #[tokio::test]
    async fn exhausted_entries_stay_queued() {
        let config = SyncConfig {
            max_attempts: 2,
            ..immediate_retries()
        };
        let (store, engine, _endpoint) = setup(MockEndpoint::failing(10), config);
        let order = store.submit_order(sample_order("store-1")).unwrap();

        engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
        let outcome = engine.sync_order(&order.id).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                retry_count: 2,
                exhausted: true,
                ..
            }
        ));

        let skipped = engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
        assert_eq!(skipped.attempted, 0);

        let status = engine.status(false).unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.exhausted, 1);
        assert!(status.last_error.is_some());

        let restored = engine
            .run_sync_cycle(SyncTrigger::ConnectivityRestored)
            .await
            .unwrap();
        assert_eq!(restored.attempted, 1);
        assert_eq!(store.list_queue().unwrap()[0].retry_count, 3);
        assert_eq!(store.get_order_status(&order.id).unwrap(), OrderStatus::Accepted);
        assert_queue_invariant(&store);
    }

    #[tokio::test]
    async fn rejected_payload_is_exhausted_at_once() {
        let endpoint = MockEndpoint {
            reject_orders: AtomicBool::new(true),
            ..MockEndpoint::default()
        };
        let (store, engine, endpoint) = setup(endpoint, immediate_retries());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        let outcome = engine.sync_order(&order.id).await.unwrap();
        let max = engine.config().max_attempts;
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                retry_count,
                exhausted: true,
                error: SyncError::Rejected(_),
            } if retry_count == max
        ));

        // Timer leaves it alone; it stays queued and flagged.
        let timer = engine.run_sync_cycle(SyncTrigger::Timer).await.unwrap();
        assert_eq!(timer.attempted, 0);
        let status = engine.status(true).unwrap();
        assert_eq!((status.pending, status.exhausted), (1, 1));
        assert!(status.last_error.unwrap().contains("HTTP 422"));
        assert_queue_invariant(&store);

        // Once the dashboard accepts it, a manual cycle delivers it.
        endpoint.reject_orders.store(false, Ordering::SeqCst);
        let manual = engine.run_sync_cycle(SyncTrigger::Manual).await.unwrap();
        assert_eq!(manual.synced, 1);
        assert_eq!(store.get_order(&order.id).unwrap().sync_failures, max);
    }

    #[tokio::test]
    async fn transient_failure_keeps_retry_budget() {
        let (store, engine, _endpoint) = setup(MockEndpoint::failing(1), immediate_retries());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        let outcome = engine.sync_order(&order.id).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Failed {
                retry_count: 1,
                exhausted: false,
                error: SyncError::Network(_),
            }
        ));
    }

    #[tokio::test]
    async fn status_change_during_push_is_forwarded() {
        let endpoint = MockEndpoint {
            delay: Duration::from_millis(100),
            ..MockEndpoint::default()
        };
        let (store, engine, endpoint) = setup(endpoint, SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        let (outcome, updated) = tokio::join!(engine.sync_order(&order.id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.push_status_update(&order.id, OrderStatus::Preparing).await
        });
        assert!(matches!(outcome.unwrap(), SyncOutcome::Synced { .. }));
        assert_eq!(updated.unwrap().status, OrderStatus::Preparing);

        // The pushed snapshot predates the change; the change follows it.
        let payload = endpoint.created.lock().unwrap().values().next().cloned().unwrap();
        assert_eq!(payload["status"], "accepted");
        assert_eq!(
            *endpoint.statuses.lock().unwrap(),
            vec![(order.id.clone(), OrderStatus::Preparing)]
        );

        let stored = store.get_order(&order.id).unwrap();
        assert!(stored.synced);
        assert_eq!(stored.status, OrderStatus::Preparing);
        assert_queue_invariant(&store);
    }

    #[tokio::test]
    async fn local_status_update_during_push_is_forwarded() {
        let endpoint = MockEndpoint {
            delay: Duration::from_millis(100),
            ..MockEndpoint::default()
        };
        let (store, engine, endpoint) = setup(endpoint, SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        let (outcome, updated) = tokio::join!(engine.sync_order(&order.id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.update_status(&order.id, OrderStatus::Ready)
        });
        assert!(matches!(outcome.unwrap(), SyncOutcome::Synced { .. }));
        assert_eq!(updated.unwrap().status, OrderStatus::Ready);
        assert_eq!(store.get_order_status(&order.id).unwrap(), OrderStatus::Ready);
        assert_eq!(
            *endpoint.statuses.lock().unwrap(),
            vec![(order.id.clone(), OrderStatus::Ready)]
        );
    }

    #[tokio::test]
    async fn status_push_on_unsynced_order_stays_local() {
        let (store, engine, endpoint) = setup(MockEndpoint::default(), SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();

        let updated = engine
            .push_status_update(&order.id, OrderStatus::Preparing)
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Preparing);
        assert!(endpoint.statuses.lock().unwrap().is_empty());

        // The queued payload carries the latest status.
        engine.sync_order(&order.id).await.unwrap();
        let payload = endpoint.created.lock().unwrap().values().next().cloned().unwrap();
        assert_eq!(payload["status"], "preparing");
    }

    #[tokio::test]
    async fn status_push_on_synced_order_reverts_on_failure() {
        let (store, engine, endpoint) = setup(MockEndpoint::default(), SyncConfig::default());
        let order = store.submit_order(sample_order("store-1")).unwrap();
        engine.sync_order(&order.id).await.unwrap();

        endpoint.reject_status.store(true, Ordering::SeqCst);
        let err = engine
            .push_status_update(&order.id, OrderStatus::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, PosError::Sync(_)));
        assert_eq!(store.get_order_status(&order.id).unwrap(), OrderStatus::Synced);

        endpoint.reject_status.store(false, Ordering::SeqCst);
        let updated = engine
            .push_status_update(&order.id, OrderStatus::Ready)
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Ready);
        assert!(updated.synced);
        assert_eq!(
            *endpoint.statuses.lock().unwrap(),
            vec![(order.id.clone(), OrderStatus::Ready)]
        );
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (_store, engine, _endpoint) = setup(MockEndpoint::default(), SyncConfig::default());
        assert!(matches!(
            engine.sync_order("missing").await,
            Err(PosError::NotFound(_))
        ));
    }

    async fn wait_for(rx: &mut watch::Receiver<SyncStatus>, pred: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if pred(&current) {
                        return current.clone();
                    }
                }
                rx.changed().await.expect("driver dropped status channel");
            }
        })
        .await
        .expect("timed out waiting for sync status")
    }

    #[tokio::test]
    async fn driver_syncs_when_connectivity_returns() {
        let config = SyncConfig {
            interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        };
        let (store, engine, endpoint) = setup(MockEndpoint::default(), config);
        let connectivity = Connectivity::new(false);

        let order = store.submit_order(sample_order("store-1")).unwrap();
        assert_eq!(order.total, 3500);
        assert_eq!(store.get_order_status(&order.id).unwrap(), OrderStatus::Accepted);
        assert_eq!(store.pending_sync_count().unwrap(), 1);

        let driver = SyncDriver::start(engine, connectivity.clone());
        let mut status = driver.status();
        assert_eq!(status.borrow().pending, 1);
        assert!(driver.is_running());

        connectivity.set_online(true);
        let settled = wait_for(&mut status, |s| s.pending == 0).await;
        assert!(settled.is_online);
        assert!(settled.last_sync.is_some());

        assert_eq!(store.get_order_status(&order.id).unwrap(), OrderStatus::Synced);
        assert_eq!(store.pending_sync_count().unwrap(), 0);
        assert_eq!(endpoint.remote_orders(), 1);

        driver.stop().await;
    }

    #[tokio::test]
    async fn force_sync_retries_exhausted_entries() {
        let config = SyncConfig {
            interval: Duration::from_secs(3600),
            max_attempts: 1,
            ..immediate_retries()
        };
        let (store, engine, _endpoint) = setup(MockEndpoint::failing(1), config);
        let order = store.submit_order(sample_order("store-1")).unwrap();
        engine.sync_order(&order.id).await.unwrap();
        assert_eq!(engine.status(false).unwrap().exhausted, 1);

        let driver = SyncDriver::start(engine, Connectivity::new(true));
        let mut status = driver.status();
        driver.force_sync();
        wait_for(&mut status, |s| s.pending == 0).await;

        let synced = store.get_order(&order.id).unwrap();
        assert!(synced.synced);
        assert_eq!(synced.sync_failures, 1);
        driver.stop().await;
    }

    #[tokio::test]
    async fn quick_reconnect_flap_still_triggers_restore_cycle() {
        let config = SyncConfig {
            interval: Duration::from_secs(3600),
            max_attempts: 1,
            ..immediate_retries()
        };
        let (store, engine, _endpoint) = setup(MockEndpoint::failing(1), config);
        let order = store.submit_order(sample_order("store-1")).unwrap();
        engine.sync_order(&order.id).await.unwrap();

        let connectivity = Connectivity::new(true);
        let driver = SyncDriver::start(engine, connectivity.clone());
        let mut status = driver.status();

        // Both transitions land before the driver task runs again, so the
        // watch value it reads is unchanged.
        connectivity.set_online(false);
        connectivity.set_online(true);
        wait_for(&mut status, |s| s.pending == 0).await;

        assert!(store.get_order(&order.id).unwrap().synced);
        driver.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let (_store, engine, _endpoint) = setup(MockEndpoint::default(), SyncConfig::default());
        let driver = SyncDriver::start(engine, Connectivity::new(true));
        let running = driver.is_running.clone();
        driver.stop().await;
        assert!(!running.load(Ordering::SeqCst));
    }
}
