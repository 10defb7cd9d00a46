use async_trait::async_trait;

use super::Database;
use crate::domain::models::{AuditCategory, AuditEvent};
use crate::ports::AuditLog;

fn category_to_str(category: AuditCategory) -> &'static str {
    match category {
        AuditCategory::SignalReceived => "signal_received",
        AuditCategory::ExecutionFilled => "execution_filled",
        AuditCategory::ExecutionSkipped => "execution_skipped",
        AuditCategory::ExecutionFailed => "execution_failed",
        AuditCategory::GuardrailTripped => "guardrail_tripped",
        AuditCategory::PositionClosed => "position_closed",
        AuditCategory::CredentialStatusChanged => "credential_status_changed",
    }
}

#[async_trait]
impl AuditLog for Database {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, category, subscriber_id, signal_id, detail_json, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(category_to_str(event.category))
        .bind(&event.subscriber_id)
        .bind(&event.signal_id)
        .bind(serde_json::to_string(&event.detail)?)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
