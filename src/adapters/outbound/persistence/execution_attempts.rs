use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use super::Database;
use crate::domain::models::{AttemptOutcome, ExecutionAttempt};
use crate::ports::ExecutionAttemptRepository;

fn outcome_to_str(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Filled => "filled",
        AttemptOutcome::Skipped => "skipped",
        AttemptOutcome::Failed => "failed",
    }
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ExecutionAttempt> {
    let outcome: String = row.try_get("outcome")?;
    Ok(ExecutionAttempt {
        id: row.try_get("id")?,
        signal_id: row.try_get("signal_id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        outcome: match outcome.as_str() {
            "filled" => AttemptOutcome::Filled,
            "failed" => AttemptOutcome::Failed,
            _ => AttemptOutcome::Skipped,
        },
        reason: row.try_get("reason")?,
        order_id: row.try_get("order_id")?,
        filled_quantity: row.try_get("filled_quantity")?,
        filled_price: row.try_get("filled_price")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ExecutionAttemptRepository for Database {
    async fn insert_pending_if_new(&self, signal_id: &str, subscriber_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_attempts (id, signal_id, subscriber_id, outcome, reason, order_id, filled_quantity, filled_price, created_at)
            VALUES (?, ?, ?, 'skipped', NULL, NULL, NULL, NULL, ?)
            ON CONFLICT(signal_id, subscriber_id) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(signal_id)
        .bind(subscriber_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_outcome(&self, attempt: &ExecutionAttempt) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_attempts SET
                outcome = ?, reason = ?, order_id = ?, filled_quantity = ?, filled_price = ?, created_at = ?
            WHERE signal_id = ? AND subscriber_id = ?
            "#,
        )
        .bind(outcome_to_str(attempt.outcome))
        .bind(&attempt.reason)
        .bind(&attempt.order_id)
        .bind(attempt.filled_quantity)
        .bind(attempt.filled_price)
        .bind(attempt.created_at)
        .bind(&attempt.signal_id)
        .bind(&attempt.subscriber_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, signal_id: &str, subscriber_id: &str) -> anyhow::Result<Option<ExecutionAttempt>> {
        let row = sqlx::query("SELECT * FROM execution_attempts WHERE signal_id = ? AND subscriber_id = ?")
            .bind(signal_id)
            .bind(subscriber_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_attempt).transpose()
    }
}
