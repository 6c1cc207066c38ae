//! Terminal credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the kernel keyutils store.

use keyring::Entry;
use tracing::{info, warn};

use crate::api::ConnectionString;
use crate::config::RemoteConfig;
use crate::error::{PosError, Result};

const SERVICE_NAME: &str = "the-small-pos";

pub const KEY_ADMIN_URL: &str = "admin_dashboard_url";
pub const KEY_API_KEY: &str = "pos_api_key";
pub const KEY_STORE_ID: &str = "store_id";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_API_KEY, KEY_STORE_ID];

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Storage(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| PosError::Storage(e.to_string()))
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Storage(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(PosError::Storage(e.to_string())),
    }
}

/// The endpoint is usable once URL, API key and store id are all present.
pub fn load_remote_config() -> Option<RemoteConfig> {
    Some(RemoteConfig {
        admin_url: get_credential(KEY_ADMIN_URL)?,
        api_key: get_credential(KEY_API_KEY)?,
        store_id: get_credential(KEY_STORE_ID)?,
    })
}

pub fn is_configured() -> bool {
    load_remote_config().is_some()
}

/// Store the credentials decoded from an onboarding connection string.
pub fn store_connection_string(raw: &str) -> Result<ConnectionString> {
    let parsed = ConnectionString::parse(raw)
        .ok_or_else(|| PosError::Config("Invalid connection string".into()))?;

    if let Some(url) = &parsed.admin_url {
        set_credential(KEY_ADMIN_URL, url)?;
    }
    if let Some(key) = &parsed.api_key {
        set_credential(KEY_API_KEY, key)?;
    }
    if let Some(store_id) = &parsed.store_id {
        set_credential(KEY_STORE_ID, store_id)?;
    }
    info!("Terminal credentials stored from connection string");
    Ok(parsed)
}

/// Remove every credential managed by this module.
pub fn factory_reset() -> Result<()> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("All terminal credentials cleared");
    Ok(())
}
