//! Service notification codec
//!
//! Parses raw queue payloads (UTF-8 JSON with an `event` discriminator)
//! into typed notifications. Anything unrecognized (malformed JSON, an
//! unknown `event`, or a recognized `event` missing required fields)
//! decodes to `None`: redelivery cannot repair such messages, so the
//! processor drops them instead of retrying.
//!
//! Source timestamps arrive in two shapes: `timestamp` is already
//! milliseconds, `ts` and `eventCreatedAt` are seconds. Everything is
//! normalized to milliseconds here.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Event kind labels used for outbound bodies and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Login,
    Subscription,
    Delete,
    Profile,
    Password,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Login => "login",
            EventKind::Subscription => "subscription",
            EventKind::Delete => "delete",
            EventKind::Profile => "profile",
            EventKind::Password => "password",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginNotification {
    pub uid: String,
    /// Absent or empty in the source means the login cannot be attributed
    /// to a client; such logins are not recorded.
    pub client_id: Option<String>,
    pub change_time_ms: i64,
    pub device_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdateNotification {
    pub uid: String,
    /// Seconds since epoch, as delivered by the subscription system
    pub event_created_at: i64,
    pub is_active: bool,
    pub product_capabilities: Vec<String>,
}

impl SubscriptionUpdateNotification {
    pub fn change_time_ms(&self) -> i64 {
        self.event_created_at * 1000
    }
}

/// Payload shared by delete, profile-change, and password-change events
#[derive(Debug, Clone, PartialEq)]
pub struct AccountEvent {
    pub uid: String,
    pub change_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceNotification {
    Login(LoginNotification),
    SubscriptionUpdate(SubscriptionUpdateNotification),
    Delete(AccountEvent),
    ProfileChange(AccountEvent),
    PasswordChange(AccountEvent),
}

impl ServiceNotification {
    pub fn kind(&self) -> EventKind {
        match self {
            ServiceNotification::Login(_) => EventKind::Login,
            ServiceNotification::SubscriptionUpdate(_) => EventKind::Subscription,
            ServiceNotification::Delete(_) => EventKind::Delete,
            ServiceNotification::ProfileChange(_) => EventKind::Profile,
            ServiceNotification::PasswordChange(_) => EventKind::Password,
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            ServiceNotification::Login(n) => &n.uid,
            ServiceNotification::SubscriptionUpdate(n) => &n.uid,
            ServiceNotification::Delete(n)
            | ServiceNotification::ProfileChange(n)
            | ServiceNotification::PasswordChange(n) => &n.uid,
        }
    }

    /// When the notified change happened, milliseconds since epoch
    pub fn change_time_ms(&self) -> i64 {
        match self {
            ServiceNotification::Login(n) => n.change_time_ms,
            ServiceNotification::SubscriptionUpdate(n) => n.change_time_ms(),
            ServiceNotification::Delete(n)
            | ServiceNotification::ProfileChange(n)
            | ServiceNotification::PasswordChange(n) => n.change_time_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogin {
    uid: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    device_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubscriptionUpdate {
    uid: String,
    event_created_at: i64,
    is_active: bool,
    product_capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccountEvent {
    uid: String,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// `timestamp` is already milliseconds and wins; `ts` is seconds
fn coerce_ms(timestamp: Option<i64>, ts: Option<f64>) -> Option<i64> {
    timestamp.or_else(|| ts.map(|seconds| (seconds * 1000.0).round() as i64))
}

fn decode_login(value: Value) -> Option<ServiceNotification> {
    let raw: RawLogin = serde_json::from_value(value).ok()?;
    let change_time_ms = coerce_ms(raw.timestamp, raw.ts)?;
    Some(ServiceNotification::Login(LoginNotification {
        uid: raw.uid,
        client_id: raw.client_id.filter(|id| !id.is_empty()),
        change_time_ms,
        device_count: raw.device_count,
    }))
}

fn decode_subscription(value: Value) -> Option<ServiceNotification> {
    let raw: RawSubscriptionUpdate = serde_json::from_value(value).ok()?;
    Some(ServiceNotification::SubscriptionUpdate(
        SubscriptionUpdateNotification {
            uid: raw.uid,
            event_created_at: raw.event_created_at,
            is_active: raw.is_active,
            product_capabilities: raw.product_capabilities,
        },
    ))
}

fn decode_account(value: Value) -> Option<AccountEvent> {
    let raw: RawAccountEvent = serde_json::from_value(value).ok()?;
    let change_time_ms = coerce_ms(raw.timestamp, raw.ts)?;
    Some(AccountEvent {
        uid: raw.uid,
        change_time_ms,
    })
}

/// Decode a raw queue payload. `None` means unwanted: drop, don't retry.
pub fn decode(body: &str) -> Option<ServiceNotification> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "dropping message that is not valid JSON");
            return None;
        }
    };

    let event = match value.get("event").and_then(Value::as_str) {
        Some(event) => event.to_owned(),
        None => {
            debug!("dropping message without event discriminator");
            return None;
        }
    };

    let decoded = match event.as_str() {
        "login" => decode_login(value),
        "subscription:update" => decode_subscription(value),
        "delete" => decode_account(value).map(ServiceNotification::Delete),
        "primaryEmailChanged" | "profileDataChange" => {
            decode_account(value).map(ServiceNotification::ProfileChange)
        }
        "passwordChange" | "reset" => {
            decode_account(value).map(ServiceNotification::PasswordChange)
        }
        other => {
            debug!(event = other, "dropping unwanted event");
            return None;
        }
    };

    if decoded.is_none() {
        debug!(event = %event, "dropping message failing validation");
    }
    decoded
}
