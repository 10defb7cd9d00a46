use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Append-only record of a state transition or notable decision, independent
/// of the structured log stream. See spec §3 "Audit Event", §4.8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub category: AuditCategory,
    pub subscriber_id: Option<String>,
    pub signal_id: Option<String>,
    pub detail: Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    SignalReceived,
    ExecutionFilled,
    ExecutionSkipped,
    ExecutionFailed,
    GuardrailTripped,
    PositionClosed,
    CredentialStatusChanged,
}

impl AuditEvent {
    pub fn new(category: AuditCategory, subscriber_id: Option<String>, signal_id: Option<String>, detail: Value) -> Self {
        AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            subscriber_id,
            signal_id,
            detail,
            occurred_at: Utc::now(),
        }
    }
}
