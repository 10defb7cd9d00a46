use async_trait::async_trait;
use sqlx::Row;

use super::Database;
use crate::domain::models::BalanceSnapshot;
use crate::ports::BalanceSnapshotRepository;

#[async_trait]
impl BalanceSnapshotRepository for Database {
    async fn record(&self, snapshot: &BalanceSnapshot) -> anyhow::Result<()> {
        let day = snapshot.taken_at.format("%Y-%m-%d").to_string();
        sqlx::query(
            r#"
            INSERT INTO balance_snapshots (subscriber_id, exchange_id, taken_at, equity, day_start_equity, day)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(subscriber_id, exchange_id, day) DO UPDATE SET
                taken_at = excluded.taken_at,
                equity = excluded.equity
            "#,
        )
        .bind(&snapshot.subscriber_id)
        .bind(&snapshot.exchange_id)
        .bind(snapshot.taken_at)
        .bind(snapshot.equity)
        .bind(snapshot.day_start_equity)
        .bind(day)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn day_start_equity(&self, subscriber_id: &str, exchange_id: &str) -> anyhow::Result<Option<f64>> {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let row = sqlx::query("SELECT day_start_equity FROM balance_snapshots WHERE subscriber_id = ? AND exchange_id = ? AND day = ?")
            .bind(subscriber_id)
            .bind(exchange_id)
            .bind(today)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<f64, _>("day_start_equity")).transpose().map_err(Into::into)
    }
}
