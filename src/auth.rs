//! PIN-based local authentication with bcrypt.
//!
//! Staff members are stored in `staff_members` with a bcrypt PIN hash. A
//! successful login creates an in-memory session that carries the staff
//! member's role and store; the route guards and `PermissionEvaluator` read
//! from it. Failed attempts are counted in `local_settings` (category
//! "staff") so a lockout survives a restart. `staff_sessions` keeps an audit
//! trail of logins and logouts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::AuthConfig;
use crate::db::{self, DbState};
use crate::error::{AuthError, Result};
use crate::permissions::{PermissionEvaluator, Role};

const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An authenticated staff session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub staff_id: String,
    pub display_name: String,
    pub role: Role,
    pub store_id: String,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Expired by inactivity or by maximum duration.
    fn is_expired_at(&self, now: DateTime<Utc>, config: &AuthConfig) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(config.session_inactivity_minutes)
    }

    pub fn evaluator(&self) -> PermissionEvaluator {
        PermissionEvaluator::for_role(self.role)
    }
}

struct StaffRecord {
    id: String,
    display_name: String,
    role: String,
    store_id: String,
    pin_hash: String,
}

struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

pub struct AuthState {
    db: Arc<DbState>,
    config: AuthConfig,
    sessions: Mutex<HashMap<String, Session>>,
    current_session_id: Mutex<Option<String>>,
    lockout: Mutex<LockoutEntry>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Numeric, at least 4 digits.
fn validate_pin(pin: &str) -> std::result::Result<(), AuthError> {
    if pin.len() < 4 {
        return Err(AuthError::InvalidPinFormat("PIN must be at least 4 digits".into()));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::InvalidPinFormat("PIN must contain only digits".into()));
    }
    Ok(())
}

fn load_lockout_from_db(conn: &Connection) -> LockoutEntry {
    let attempts = db::get_setting(conn, "staff", LOCKOUT_ATTEMPTS_KEY)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, "staff", LOCKOUT_LAST_ATTEMPT_KEY)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    LockoutEntry {
        attempts,
        last_attempt,
    }
}

fn persist_lockout_to_db(conn: &Connection, lockout: &LockoutEntry) -> Result<()> {
    db::set_setting(conn, "staff", LOCKOUT_ATTEMPTS_KEY, &lockout.attempts.to_string())?;
    db::set_setting(
        conn,
        "staff",
        LOCKOUT_LAST_ATTEMPT_KEY,
        &db::timestamp(lockout.last_attempt),
    )
}

fn active_staff(conn: &Connection) -> Result<Vec<StaffRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, display_name, role, store_id, pin_hash
         FROM staff_members WHERE is_active = 1 ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(StaffRecord {
                id: row.get(0)?,
                display_name: row.get(1)?,
                role: row.get(2)?,
                store_id: row.get(3)?,
                pin_hash: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn end_session_record(conn: &Connection, session_id: &str) {
    if let Err(e) = conn.execute(
        "UPDATE staff_sessions SET logout_time = ?1, is_active = 0 WHERE id = ?2",
        params![db::now(), session_id],
    ) {
        warn!(session_id, error = %e, "Failed to close session record");
    }
}

// ---------------------------------------------------------------------------
// AuthState
// ---------------------------------------------------------------------------

impl AuthState {
    pub fn new(db: Arc<DbState>, config: AuthConfig) -> Self {
        Self {
            db,
            config,
            sessions: Mutex::new(HashMap::new()),
            current_session_id: Mutex::new(None),
            lockout: Mutex::new(LockoutEntry {
                attempts: 0,
                last_attempt: Utc::now(),
            }),
        }
    }

    /// Create or replace a staff member. The PIN is stored only as a bcrypt
    /// hash.
    pub fn setup_staff(
        &self,
        id: &str,
        display_name: &str,
        role: Role,
        store_id: &str,
        pin: &str,
    ) -> Result<()> {
        validate_pin(pin)?;
        let hash = bcrypt::hash(pin, HASH_COST)
            .map_err(|e| AuthError::InvalidPinFormat(format!("Failed to hash PIN: {e}")))?;

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO staff_members (id, display_name, role, store_id, pin_hash, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                role = excluded.role,
                store_id = excluded.store_id,
                pin_hash = excluded.pin_hash,
                is_active = 1,
                updated_at = excluded.updated_at",
            params![id, display_name, role.as_str(), store_id, hash, db::now()],
        )?;
        info!(staff_id = %id, role = %role, "Staff member saved");
        Ok(())
    }

    /// Persisted lockout state, with the counter reset once the window has
    /// passed. Fails while the terminal is locked out.
    fn current_lockout(&self, conn: &Connection) -> Result<LockoutEntry> {
        let mut lockout = load_lockout_from_db(conn);
        if lockout.attempts >= self.config.max_failed_attempts {
            let elapsed = Utc::now() - lockout.last_attempt;
            if elapsed < Duration::minutes(self.config.lockout_minutes) {
                let minutes = (self.config.lockout_minutes - elapsed.num_minutes()).max(1);
                return Err(AuthError::LockedOut { minutes }.into());
            }
            lockout.attempts = 0;
        }
        Ok(lockout)
    }

    /// Verify the PIN against every active staff member and open a session.
    pub fn login(&self, pin: String) -> Result<Session> {
        let pin = Zeroizing::new(pin);
        if pin.is_empty() {
            return Err(AuthError::InvalidPinFormat("PIN is required".into()).into());
        }

        // bcrypt runs with the connection lock released.
        let candidates = {
            let conn = self.db.lock()?;
            self.current_lockout(&conn)?;
            active_staff(&conn)?
        };
        let matched = candidates
            .into_iter()
            .find(|staff| bcrypt::verify(pin.as_str(), &staff.pin_hash).unwrap_or(false));

        let conn = self.db.lock()?;
        let mut lockout = self.lockout.lock().unwrap_or_else(|e| e.into_inner());
        // Re-read: other attempts may have landed while verifying.
        *lockout = self.current_lockout(&conn)?;

        let Some(staff) = matched else {
            lockout.attempts += 1;
            lockout.last_attempt = Utc::now();
            persist_lockout_to_db(&conn, &lockout)?;
            warn!(attempts = lockout.attempts, "failed login attempt");
            return Err(AuthError::InvalidPin.into());
        };

        let role: Role = staff.role.parse().map_err(|e: String| {
            warn!(staff_id = %staff.id, role = %staff.role, "Stored staff role is invalid");
            AuthError::InvalidPinFormat(e)
        })?;

        lockout.attempts = 0;
        lockout.last_attempt = Utc::now();
        persist_lockout_to_db(&conn, &lockout)?;

        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            staff_id: staff.id,
            display_name: staff.display_name,
            role,
            store_id: staff.store_id,
            login_time: now,
            last_activity: now,
            expires_at: now + Duration::hours(self.config.session_max_duration_hours),
        };

        conn.execute(
            "INSERT INTO staff_sessions (id, staff_id, role, store_id, login_time, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                &session.session_id,
                &session.staff_id,
                role.as_str(),
                &session.store_id,
                db::timestamp(now)
            ],
        )?;

        // Single active session per terminal.
        let mut current = self.current_session_id.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.take() {
            sessions.remove(&previous);
            end_session_record(&conn, &previous);
        }
        sessions.insert(session.session_id.clone(), session.clone());
        *current = Some(session.session_id.clone());

        info!(staff_id = %session.staff_id, role = %role, "staff login successful");
        Ok(session)
    }

    pub fn logout(&self) {
        let sid = self
            .current_session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sid) = sid {
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&sid);
            if let Ok(conn) = self.db.lock() {
                end_session_record(&conn, &sid);
            }
            info!(session_id = %sid, "session logged out");
        }
    }

    /// The current session, if any. An expired session is closed and dropped.
    pub fn current_session(&self) -> Option<Session> {
        let expired = {
            let mut current = self.current_session_id.lock().unwrap_or_else(|e| e.into_inner());
            let sid = current.clone()?;
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let session = sessions.get(&sid)?;
            if !session.is_expired_at(Utc::now(), &self.config) {
                return Some(session.clone());
            }
            sessions.remove(&sid);
            *current = None;
            sid
        };

        if let Ok(conn) = self.db.lock() {
            end_session_record(&conn, &expired);
        }
        info!(session_id = %expired, "session expired");
        None
    }

    /// Refresh the inactivity timer.
    pub fn track_activity(&self) {
        let current = self
            .current_session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sid) = current {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = sessions.get_mut(&sid) {
                session.last_activity = Utc::now();
            }
        }
    }

    /// Evaluator for the logged-in role; anonymous when nobody is logged in.
    pub fn evaluator(&self) -> PermissionEvaluator {
        self.current_session()
            .map(|s| s.evaluator())
            .unwrap_or_else(PermissionEvaluator::anonymous)
    }
}
