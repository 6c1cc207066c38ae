//! The Small POS - offline core
//!
//! Order capture that never waits on the network, background delivery to the
//! admin dashboard, and role-based access for staff sessions. `PosCore` wires
//! the services together for the host application.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod auth;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod guards;
pub mod logging;
pub mod optimistic;
pub mod orders;
pub mod permissions;
pub mod storage;
pub mod sync;

pub use auth::{AuthState, Session};
pub use config::{PosConfig, SyncConfig};
pub use connectivity::Connectivity;
pub use error::{AuthError, PosError, Result, SyncError};
pub use guards::{navigate, Navigation, RedirectReason, Route, RouteAccess};
pub use orders::{LineItem, NewOrder, Order, OrderStatus, OrderStore, PaymentMethod};
pub use permissions::{Action, Feature, PermissionEvaluator, Resource, Role};
pub use sync::{SyncDriver, SyncEndpoint, SyncEngine, SyncOutcome, SyncStatus, SyncTrigger};

/// Health probe period when an admin endpoint is configured.
const HEALTH_PROBE_INTERVAL_SECS: u64 = 30;

/// Service container handed to the host application.
pub struct PosCore {
    pub db: Arc<db::DbState>,
    pub config: PosConfig,
    pub orders: OrderStore,
    pub auth: AuthState,
    pub connectivity: Connectivity,
    engine: Option<Arc<SyncEngine>>,
    admin: Option<Arc<api::AdminClient>>,
    driver: Option<SyncDriver>,
    health: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl PosCore {
    /// Open the database under `data_dir`, load configuration and build the
    /// admin client when credentials are present. Background work starts with
    /// `start_background`.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        info!(
            "Starting The Small POS core v{} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("BUILD_GIT_SHA")
        );

        let db = Arc::new(db::init(data_dir).context("initializing local database")?);
        let config = {
            let conn = db.lock()?;
            PosConfig::load(&conn).context("loading configuration")?
        };

        let admin = match &config.remote {
            Some(remote) => Some(Arc::new(
                api::AdminClient::new(remote, config.sync.request_timeout)
                    .context("building admin dashboard client")?,
            )),
            None => None,
        };

        let mut core = Self::with_endpoint(
            db,
            config,
            admin.clone().map(|a| a as Arc<dyn SyncEndpoint>),
        );
        core.admin = admin;
        Ok(core)
    }

    /// Assemble from parts. Without an endpoint, orders stay queued locally.
    pub fn with_endpoint(
        db: Arc<db::DbState>,
        config: PosConfig,
        endpoint: Option<Arc<dyn SyncEndpoint>>,
    ) -> Self {
        let engine = endpoint.map(|ep| Arc::new(SyncEngine::new(db.clone(), ep, config.sync.clone())));
        Self {
            orders: OrderStore::new(db.clone()),
            auth: AuthState::new(db.clone(), config.auth.clone()),
            connectivity: Connectivity::new(false),
            db,
            config,
            engine,
            admin: None,
            driver: None,
            health: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the sync driver, and the health probe when talking to the real
    /// dashboard. Must be called inside a tokio runtime. Idempotent.
    pub fn start_background(&mut self) {
        let Some(engine) = self.engine.clone() else {
            info!("Sync disabled: no admin endpoint configured");
            return;
        };
        if self.driver.is_none() {
            self.driver = Some(SyncDriver::start(engine, self.connectivity.clone()));
        }
        if self.health.is_none() {
            if let Some(admin) = &self.admin {
                self.health = Some(connectivity::spawn_health_monitor(
                    self.connectivity.clone(),
                    admin.clone(),
                    std::time::Duration::from_secs(HEALTH_PROBE_INTERVAL_SECS),
                    self.shutdown.clone(),
                ));
            }
        }
    }

    pub fn sync_engine(&self) -> Option<&Arc<SyncEngine>> {
        self.engine.as_ref()
    }

    /// Accept an order locally. When online, the driver is nudged so delivery
    /// does not wait for the next timer tick.
    pub fn submit_order(&self, order: NewOrder) -> Result<Order> {
        let order = self.orders.submit_order(order)?;
        if self.connectivity.is_online() {
            if let Some(driver) = &self.driver {
                driver.force_sync();
            }
        }
        Ok(order)
    }

    pub fn force_sync(&self) {
        match &self.driver {
            Some(driver) => driver.force_sync(),
            None => warn!("force_sync requested but the sync driver is not running"),
        }
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        let online = self.connectivity.is_online();
        match &self.engine {
            Some(engine) => engine.status(online),
            None => Ok(SyncStatus {
                is_online: online,
                pending: self.orders.pending_sync_count()?,
                ..SyncStatus::default()
            }),
        }
    }

    /// Guard check for the current session.
    pub fn navigate(&self, route: &Route, store_id: Option<&str>) -> Navigation {
        let session = self.auth.current_session();
        let nav = navigate(session.as_ref(), route, store_id);
        if nav.is_allowed() && session.is_some() {
            self.auth.track_activity();
        }
        nav
    }

    /// Store credentials from an onboarding connection string. They take
    /// effect on the next `open`.
    pub fn configure_from_connection_string(&self, raw: &str) -> Result<()> {
        storage::store_connection_string(raw).map(|_| ())
    }

    /// Clear stored credentials and log out.
    pub fn factory_reset(&self) -> Result<()> {
        self.auth.logout();
        storage::factory_reset()
    }

    /// Stop background tasks. A sync cycle in progress completes first.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(driver) = self.driver.take() {
            driver.stop().await;
        }
        if let Some(health) = self.health.take() {
            if let Err(e) = health.await {
                warn!(error = %e, "Health monitor ended abnormally");
            }
        }
        info!("POS core stopped");
    }
}
