//! Local order store.
//!
//! Orders are written to SQLite together with their sync queue entry in a
//! single transaction and returned immediately with status `accepted`; the
//! network is never touched here. The queue entry exists exactly as long as
//! the order's `synced` flag is false (see `sync` for the removal side).

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{PosError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    /// Minor currency units (cents).
    pub unit_price: i64,
}

impl LineItem {
    pub fn new(sku: impl Into<String>, name: impl Into<String>, quantity: u32, unit_price: i64) -> Self {
        Self {
            sku: sku.into(),
            name: name.into(),
            quantity,
            unit_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mobile,
    Voucher,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Mobile => "mobile",
            PaymentMethod::Voucher => "voucher",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" | "credit_card" | "debit_card" => Ok(PaymentMethod::Card),
            "mobile" | "digital_wallet" => Ok(PaymentMethod::Mobile),
            "voucher" => Ok(PaymentMethod::Voucher),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// Order lifecycle. `Synced` marks the hand-off to the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Queued,
    Accepted,
    Preparing,
    Ready,
    Synced,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Queued => "queued",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Synced => "synced",
        }
    }

    /// Position in the kitchen flow. A synced order counts as freshly accepted
    /// for the purpose of later kitchen updates.
    fn stage(self) -> u8 {
        match self {
            OrderStatus::Queued => 0,
            OrderStatus::Accepted | OrderStatus::Synced => 1,
            OrderStatus::Preparing => 2,
            OrderStatus::Ready => 3,
        }
    }

    /// Whether staff may move an order from `self` to `next`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(next, OrderStatus::Preparing | OrderStatus::Ready) && next.stage() > self.stage()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(OrderStatus::Queued),
            "accepted" => Ok(OrderStatus::Accepted),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "synced" => Ok(OrderStatus::Synced),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// A finalized order as submitted by the POS, kiosk or customer app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub store_id: String,
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub staff_id: Option<String>,
    /// Checkout-level dedup key; a repeated submit returns the first order.
    #[serde(default)]
    pub client_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: Option<String>,
    pub store_id: String,
    pub items: Vec<LineItem>,
    pub total: i64,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub synced: bool,
    pub idempotency_key: String,
    pub client_request_id: Option<String>,
    pub staff_id: Option<String>,
    /// Failed delivery attempts before the one that succeeded.
    pub sync_failures: u32,
    pub created_at: String,
    pub updated_at: String,
    pub synced_at: Option<String>,
}

/// Pending-sync marker, distinct from the order record itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub order_id: String,
    pub idempotency_key: String,
    pub enqueued_at: String,
    pub retry_count: u32,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, order_number, store_id, items, total_amount, payment_method,
    status, synced, idempotency_key, client_request_id, staff_id, sync_failures,
    created_at, updated_at, synced_at";

const QUEUE_COLUMNS: &str =
    "order_id, idempotency_key, enqueued_at, retry_count, next_retry_at, last_error";

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg),
    )
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let items_json: String = row.get(3)?;
    let items: Vec<LineItem> =
        serde_json::from_str(&items_json).map_err(|e| conversion_error(3, e.to_string()))?;
    let payment_method: String = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        store_id: row.get(2)?,
        items,
        total: row.get(4)?,
        payment_method: payment_method
            .parse()
            .map_err(|e: String| conversion_error(5, e))?,
        status: status.parse().map_err(|e: String| conversion_error(6, e))?,
        synced: row.get::<_, i64>(7)? != 0,
        idempotency_key: row.get(8)?,
        client_request_id: row.get(9)?,
        staff_id: row.get(10)?,
        sync_failures: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        synced_at: row.get(14)?,
    })
}

fn queue_entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        order_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        enqueued_at: row.get(2)?,
        retry_count: row.get(3)?,
        next_retry_at: row.get(4)?,
        last_error: row.get(5)?,
    })
}

pub(crate) fn load_order(conn: &Connection, id: &str) -> Result<Option<Order>> {
    let order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

pub(crate) fn load_queue_entry(conn: &Connection, order_id: &str) -> Result<Option<QueueEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE order_id = ?1"),
            params![order_id],
            queue_entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

pub(crate) fn load_queue(conn: &Connection) -> Result<Vec<QueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY enqueued_at ASC, id ASC"
    ))?;
    let entries = stmt
        .query_map([], queue_entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Overwrite the lifecycle status. Returns the previous status.
pub(crate) fn write_status(conn: &Connection, id: &str, status: OrderStatus) -> Result<OrderStatus> {
    let previous = load_order(conn, id)?
        .ok_or_else(|| PosError::NotFound(format!("order {id}")))?
        .status;
    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), db::now(), id],
    )?;
    Ok(previous)
}

// ---------------------------------------------------------------------------
// Order number generation
// ---------------------------------------------------------------------------

/// Generate a sequential order number in format ORD-DDMMYYYY-NNNNN.
///
/// Uses `local_settings` (category='orders', key='order_counter') as a
/// persistent counter.
fn next_order_number(conn: &Connection) -> Result<String> {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();

    let current: i64 = db::get_setting(conn, "orders", "order_counter")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    db::set_setting(conn, "orders", "order_counter", &next.to_string())?;

    Ok(format!("ORD-{}-{:05}", date_display, next))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a submission and return its computed total.
fn validate(order: &NewOrder) -> Result<i64> {
    if order.store_id.trim().is_empty() {
        return Err(PosError::Validation("storeId is required".into()));
    }
    if order.items.is_empty() {
        return Err(PosError::Validation("order must contain at least one item".into()));
    }

    let mut total: i64 = 0;
    for (idx, item) in order.items.iter().enumerate() {
        if item.sku.trim().is_empty() || item.name.trim().is_empty() {
            return Err(PosError::Validation(format!("item {idx}: sku and name are required")));
        }
        if item.quantity == 0 {
            return Err(PosError::Validation(format!("item {idx}: quantity must be positive")));
        }
        if item.unit_price < 0 {
            return Err(PosError::Validation(format!("item {idx}: unit price must not be negative")));
        }
        total = item
            .unit_price
            .checked_mul(i64::from(item.quantity))
            .and_then(|line| total.checked_add(line))
            .ok_or_else(|| PosError::Validation("order total overflows".into()))?;
    }

    if total < 0 {
        return Err(PosError::Validation("order total must not be negative".into()));
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct OrderStore {
    db: Arc<DbState>,
}

impl OrderStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Persist an order locally as `accepted` and enqueue it for sync.
    pub fn submit_order(&self, new_order: NewOrder) -> Result<Order> {
        let total = validate(&new_order)?;

        let client_request_id = new_order
            .client_request_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;

        // Idempotency guard: if this checkout request has already created an order,
        // return that order instead of inserting a duplicate row.
        if let Some(req_id) = client_request_id.as_deref() {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM orders WHERE client_request_id = ?1 LIMIT 1",
                    params![req_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(order_id) = existing {
                info!(
                    order_id = %order_id,
                    client_request_id = %req_id,
                    "Order submit deduplicated via client_request_id"
                );
                return load_order(&tx, &order_id)?
                    .ok_or_else(|| PosError::NotFound(format!("order {order_id}")));
            }
        }

        let order_id = Uuid::new_v4().to_string();
        let idempotency_key = format!("order:{order_id}:insert");
        let now = db::now();
        let order_number = next_order_number(&tx)?;
        let items_json = serde_json::to_string(&new_order.items)?;

        tx.execute(
            "INSERT INTO orders (
                id, order_number, store_id, items, total_amount, payment_method,
                status, synced, idempotency_key, client_request_id, staff_id,
                sync_failures, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                &order_id,
                &order_number,
                new_order.store_id.trim(),
                &items_json,
                total,
                new_order.payment_method.as_str(),
                OrderStatus::Accepted.as_str(),
                &idempotency_key,
                &client_request_id,
                &new_order.staff_id,
                &now,
            ],
        )
        .map_err(|e| PosError::Storage(format!("insert order: {e}")))?;

        tx.execute(
            "INSERT INTO sync_queue (order_id, idempotency_key, retry_count, enqueued_at)
             VALUES (?1, ?2, 0, ?3)",
            params![&order_id, &idempotency_key, &now],
        )
        .map_err(|e| PosError::Storage(format!("enqueue sync: {e}")))?;

        let order = load_order(&tx, &order_id)?
            .ok_or_else(|| PosError::Storage(format!("order {order_id} vanished after insert")))?;
        tx.commit()?;

        info!(order_id = %order_id, total = total, "Order accepted and queued for sync");
        Ok(order)
    }

    pub fn get_order(&self, id: &str) -> Result<Order> {
        let conn = self.db.lock()?;
        load_order(&conn, id)?.ok_or_else(|| PosError::NotFound(format!("order {id}")))
    }

    pub fn get_order_status(&self, id: &str) -> Result<OrderStatus> {
        self.get_order(id).map(|o| o.status)
    }

    /// All orders, most recent first.
    pub fn list_orders(&self) -> Result<Vec<Order>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, rowid DESC"
        ))?;
        let orders = stmt
            .query_map([], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.db.lock()?;
        load_queue(&conn)
    }

    pub fn pending_sync_count(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Advance an order through the kitchen flow (`preparing`, `ready`).
    ///
    /// Purely local. An unsynced order carries the new status in its queued
    /// payload; synced orders should go through
    /// `SyncEngine::push_status_update` so the dashboard sees the change.
    pub fn update_status(&self, id: &str, status: OrderStatus) -> Result<Order> {
        let conn = self.db.lock()?;
        let order = load_order(&conn, id)?.ok_or_else(|| PosError::NotFound(format!("order {id}")))?;
        if !order.status.can_transition_to(status) {
            return Err(PosError::Validation(format!(
                "cannot move order from {} to {}",
                order.status, status
            )));
        }
        write_status(&conn, id, status)?;
        debug!(order_id = %id, from = %order.status, to = %status, "Order status updated");
        load_order(&conn, id)?.ok_or_else(|| PosError::NotFound(format!("order {id}")))
    }
}

#[cfg(test)]
pub(crate) fn sample_order(store_id: &str) -> NewOrder {
    NewOrder {
        store_id: store_id.to_string(),
        items: vec![
            LineItem::new("BURGER-01", "Classic Burger", 2, 1200),
            LineItem::new("COLA-33", "Cola 33cl", 1, 1100),
        ],
        payment_method: PaymentMethod::Card,
        staff_id: None,
        client_request_id: None,
    }
}
