use async_trait::async_trait;
use sqlx::Row;

use super::Database;
use crate::domain::models::{ApprovalStatus, Credential};
use crate::ports::CredentialRepository;

pub(crate) fn row_to_credential(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Credential> {
    let status: String = row.try_get("status")?;
    Ok(Credential {
        id: row.try_get("id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        exchange_id: row.try_get("exchange_id")?,
        status: match status.as_str() {
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            _ => ApprovalStatus::Pending,
        },
        active: row.try_get::<i64, _>("active")? != 0,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl CredentialRepository for Database {
    async fn find_usable_for_exchange(&self, subscriber_id: &str, exchange_id: &str) -> anyhow::Result<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE subscriber_id = ? AND exchange_id = ? AND active = 1 AND status = 'approved'")
            .bind(subscriber_id)
            .bind(exchange_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_credential).transpose()
    }

    async fn list_for_subscriber(&self, subscriber_id: &str) -> anyhow::Result<Vec<Credential>> {
        let rows = sqlx::query("SELECT * FROM credentials WHERE subscriber_id = ?").bind(subscriber_id).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_credential).collect()
    }
}
