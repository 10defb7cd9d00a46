use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AttemptFailure;

/// One subscriber's attempted response to one signal. The
/// `(signal_id, subscriber_id)` pair is unique in storage and is the
/// idempotency fence described in spec §4.4 step 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: String,
    pub signal_id: String,
    pub subscriber_id: String,
    pub outcome: AttemptOutcome,
    pub reason: Option<String>,
    pub order_id: Option<String>,
    pub filled_quantity: Option<f64>,
    pub filled_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Filled,
    Skipped,
    Failed,
}

impl ExecutionAttempt {
    pub fn skipped(signal_id: &str, subscriber_id: &str, reason: crate::error::SkipReason) -> Self {
        ExecutionAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            outcome: AttemptOutcome::Skipped,
            reason: Some(reason.to_string()),
            order_id: None,
            filled_quantity: None,
            filled_price: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(signal_id: &str, subscriber_id: &str, failure: &AttemptFailure) -> Self {
        ExecutionAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            outcome: AttemptOutcome::Failed,
            reason: Some(failure.to_string()),
            order_id: None,
            filled_quantity: None,
            filled_price: None,
            created_at: Utc::now(),
        }
    }

    pub fn filled(
        signal_id: &str,
        subscriber_id: &str,
        order_id: String,
        filled_quantity: f64,
        filled_price: f64,
    ) -> Self {
        ExecutionAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            outcome: AttemptOutcome::Filled,
            reason: None,
            order_id: Some(order_id),
            filled_quantity: Some(filled_quantity),
            filled_price: Some(filled_price),
            created_at: Utc::now(),
        }
    }
}
