use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// Tracing target of audit records. The binary routes it to a JSON-lines
/// file and keeps it off stdout.
pub const AUDIT_TARGET: &str = "audit";

pub const EVENT_UNAUTHORIZED: &str = "unauthorized_sender";
pub const EVENT_PROVIDER_ENTER: &str = "provider_enter";
pub const EVENT_CONFIRM_DISPATCH: &str = "confirm_dispatch";
pub const EVENT_CANCEL: &str = "cancel";
pub const EVENT_MENU_SYNC: &str = "menu_sync";

#[derive(Debug, Serialize)]
pub struct AuditEvent<'a> {
    pub timestamp_ms: i64,
    pub event_type: &'a str,
    pub user_id: &'a str,
    pub details: Value,
}

impl<'a> AuditEvent<'a> {
    pub fn new(event_type: &'a str, user_id: &'a str, details: Value) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event_type,
            user_id,
            details,
        }
    }
}

pub fn log_audit(event_type: &str, user_id: &str, details: Value) {
    let event = AuditEvent::new(event_type, user_id, details);
    // The record is emitted pre-serialized so the audit file holds clean JSON.
    if let Ok(json_str) = serde_json::to_string(&event) {
        info!(target: AUDIT_TARGET, "{}", json_str);
    }
}
