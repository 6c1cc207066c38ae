//! Runtime configuration.
//!
//! Defaults are compiled in; operators override the sync knobs through
//! `local_settings` (category `sync`) and the dashboard endpoint comes from
//! the OS credential store (see `storage`).

use rusqlite::Connection;
use std::time::Duration;
use tracing::{info, warn};

use crate::db;
use crate::error::{PosError, Result};
use crate::storage;

const SYNC_CATEGORY: &str = "sync";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Background timer period.
    pub interval: Duration,
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    /// Failed attempts after which the timer stops retrying an entry.
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            base_delay: Duration::from_millis(5_000),
            growth_factor: 2.0,
            max_delay: Duration::from_millis(300_000),
            max_attempts: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// `min(base * growth_factor^retries, max_delay)`.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !scaled.is_finite() || scaled >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(PosError::Config("sync interval must be positive".into()));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(PosError::Config("growth factor must be >= 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(PosError::Config("base delay exceeds max delay".into()));
        }
        if self.max_attempts == 0 {
            return Err(PosError::Config("max attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply overrides stored in `local_settings`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_local_settings(&mut self, conn: &Connection) {
        fn read<T: std::str::FromStr>(conn: &Connection, key: &str) -> Option<T> {
            let raw = db::get_setting(conn, SYNC_CATEGORY, key)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparseable sync setting");
                    None
                }
            }
        }

        if let Some(secs) = read::<u64>(conn, "interval_secs") {
            self.interval = Duration::from_secs(secs);
        }
        if let Some(ms) = read::<u64>(conn, "base_delay_ms") {
            self.base_delay = Duration::from_millis(ms);
        }
        if let Some(f) = read::<f64>(conn, "growth_factor") {
            self.growth_factor = f;
        }
        if let Some(ms) = read::<u64>(conn, "max_delay_ms") {
            self.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = read::<u32>(conn, "max_attempts") {
            self.max_attempts = n;
        }
        if let Some(secs) = read::<u64>(conn, "request_timeout_secs") {
            self.request_timeout = Duration::from_secs(secs);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub max_failed_attempts: u32,
    pub lockout_minutes: i64,
    pub session_inactivity_minutes: i64,
    pub session_max_duration_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_minutes: 15,
            session_inactivity_minutes: 30,
            session_max_duration_hours: 2,
        }
    }
}

/// Where queued orders are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub admin_url: String,
    pub api_key: String,
    pub store_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PosConfig {
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    pub remote: Option<RemoteConfig>,
}

impl PosConfig {
    /// Defaults, then `local_settings` overrides, then keyring credentials.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut config = PosConfig::default();
        config.sync.apply_local_settings(conn);
        config.sync.validate()?;
        config.remote = storage::load_remote_config();
        match &config.remote {
            Some(remote) => info!(admin_url = %remote.admin_url, "Remote sync endpoint configured"),
            None => info!("No remote endpoint configured; orders stay queued locally"),
        }
        Ok(config)
    }
}
