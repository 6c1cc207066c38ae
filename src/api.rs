//! Admin dashboard API client.
//!
//! Authenticated HTTP communication with the admin dashboard: the health
//! probe used for connectivity, order delivery and kitchen status pushes.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::error::{PosError, SyncError};
use crate::orders::OrderStatus;
use crate::sync::{SyncAck, SyncEndpoint};

/// Timeout used specifically for the lightweight health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // In case "/api/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Onboarding connection string
// ---------------------------------------------------------------------------

/// Credentials packed into an onboarding connection string: plain JSON or
/// URL-safe base64 of `{"url": ..., "key": ..., "sid": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub admin_url: Option<String>,
    pub api_key: Option<String>,
    pub store_id: Option<String>,
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn non_empty(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Option<Self> {
        let payload = decode_connection_string_payload(raw)?;
        let parsed = Self {
            admin_url: non_empty(&payload, &["url"]).map(|u| normalize_admin_url(&u)),
            api_key: non_empty(&payload, &["key"]),
            store_id: non_empty(&payload, &["sid", "storeId"]),
        };
        if parsed.admin_url.is_none() && parsed.api_key.is_none() && parsed.store_id.is_none() {
            return None;
        }
        Some(parsed)
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::Network(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_timeout() {
        return SyncError::Network(format!("Connection to {url} timed out"));
    }
    SyncError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        429 => "Queue is backed up. Please retry later.".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Build the error for a non-success response, preserving validation details.
fn status_error(status: StatusCode, body_text: &str) -> SyncError {
    let body = body_text.trim();
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            let message = non_empty(&json, &["error", "message"])?;
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => Some(format!("{message}: {details}")),
                None => Some(message),
            }
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                status_message(status)
            } else {
                format!("{}: {body}", status_message(status))
            }
        });

    let code = status.as_u16();
    if code >= 500 || code == 429 || code == 408 || code == 401 || code == 403 {
        SyncError::Server {
            status: code,
            message,
        }
    } else {
        SyncError::Rejected(format!("{message} (HTTP {code})"))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AdminClient {
    base_url: String,
    api_key: String,
    store_id: String,
    client: Client,
}

impl AdminClient {
    pub fn new(remote: &RemoteConfig, timeout: Duration) -> Result<Self, PosError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PosError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_admin_url(&remote.admin_url),
            api_key: remote.api_key.clone(),
            store_id: remote.store_id.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Quick network check: HEAD request to `/api/health`.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .client
            .head(&url)
            .timeout(HEALTH_TIMEOUT)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<(StatusCode, Value), SyncError> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-store-id", &self.store_id)
            .json(body);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if status == StatusCode::CONFLICT || status.is_success() {
            let json = if body_text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&body_text).unwrap_or(Value::Null)
            };
            return Ok((status, json));
        }

        Err(status_error(status, &body_text))
    }
}

#[async_trait]
impl SyncEndpoint for AdminClient {
    async fn push_order(&self, payload: &Value, idempotency_key: &str) -> Result<SyncAck, SyncError> {
        let (status, json) = self
            .send(Method::POST, "/api/pos/orders/sync", payload, Some(idempotency_key))
            .await?;

        // 409 means the dashboard already holds an order under this key.
        let duplicate = status == StatusCode::CONFLICT
            || json.get("duplicate").and_then(Value::as_bool).unwrap_or(false);
        let remote_id = non_empty(&json, &["id", "orderId"])
            .or_else(|| json.get("data").and_then(|d| non_empty(d, &["id", "orderId"])));

        info!(idempotency_key, duplicate, "Order delivered to admin dashboard");
        Ok(SyncAck {
            remote_id,
            duplicate,
        })
    }

    async fn push_status(&self, order_id: &str, status: OrderStatus) -> Result<(), SyncError> {
        let path = format!("/api/pos/orders/{order_id}/status");
        let body = serde_json::json!({ "status": status.as_str() });
        self.send(Method::PATCH, &path, &body, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_admin_urls() {
        assert_eq!(normalize_admin_url("admin.thesmall.app/"), "https://admin.thesmall.app");
        assert_eq!(normalize_admin_url("localhost:3001/api/"), "http://localhost:3001");
        assert_eq!(
            normalize_admin_url(" https://admin.thesmall.app/api "),
            "https://admin.thesmall.app"
        );
    }

    #[test]
    fn parses_plain_json_connection_string() {
        let parsed = ConnectionString::parse(
            r#"{"url":"admin.thesmall.app/api","key":"pos_live_123","sid":"store-9"}"#,
        )
        .unwrap();
        assert_eq!(parsed.admin_url.as_deref(), Some("https://admin.thesmall.app"));
        assert_eq!(parsed.api_key.as_deref(), Some("pos_live_123"));
        assert_eq!(parsed.store_id.as_deref(), Some("store-9"));
    }

    #[test]
    fn parses_base64_connection_string() {
        let raw = BASE64_STANDARD
            .encode(r#"{"url":"https://admin.thesmall.app","key":"pos_live_abc"}"#)
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string();
        let parsed = ConnectionString::parse(&raw).unwrap();
        assert_eq!(parsed.api_key.as_deref(), Some("pos_live_abc"));
        assert_eq!(parsed.store_id, None);

        assert!(ConnectionString::parse("short").is_none());
        assert!(ConnectionString::parse("{}").is_none());
    }

    #[test]
    fn status_errors_keep_details() {
        let err = status_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Invalid menu items","details":["BURGER-01"]}"#,
        );
        assert_eq!(
            err,
            SyncError::Rejected("Invalid menu items: [\"BURGER-01\"] (HTTP 422)".into())
        );
        assert!(!err.is_transient());

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Admin dashboard server error (HTTP 503)");
    }
}
