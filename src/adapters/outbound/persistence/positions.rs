use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Database;
use crate::domain::models::{Position, PositionKey, PositionSide, PositionStatus};
use crate::ports::PositionRepository;

fn side_to_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "long",
        PositionSide::Short => "short",
    }
}

fn status_to_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "open",
        PositionStatus::Closing => "closing",
        PositionStatus::Closed => "closed",
    }
}

fn str_to_status(status: &str) -> PositionStatus {
    match status {
        "closed" => PositionStatus::Closed,
        "closing" => PositionStatus::Closing,
        _ => PositionStatus::Open,
    }
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Position> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    Ok(Position {
        id: row.try_get("id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        exchange_id: row.try_get("exchange_id")?,
        credential_id: row.try_get("credential_id")?,
        symbol: row.try_get("symbol")?,
        side: if side == "short" { PositionSide::Short } else { PositionSide::Long },
        status: str_to_status(&status),
        entry_price: row.try_get("entry_price")?,
        quantity: row.try_get("quantity")?,
        tp_percent: row.try_get("tp_percent")?,
        sl_percent: row.try_get("sl_percent")?,
        tp_order_id: row.try_get("tp_order_id")?,
        sl_order_id: row.try_get("sl_order_id")?,
        dca_additions: row.try_get::<i64, _>("dca_additions")? as u32,
        last_addition_price: row.try_get("last_addition_price")?,
        last_addition_qty: row.try_get("last_addition_qty")?,
        trailing_stop_armed: row.try_get::<i64, _>("trailing_stop_armed")? != 0,
        trailing_stop_high_water: row.try_get("trailing_stop_high_water")?,
        opened_at: row.try_get("opened_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

#[async_trait]
impl PositionRepository for Database {
    async fn find_open(&self, key: &PositionKey) -> anyhow::Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE subscriber_id = ? AND exchange_id = ? AND symbol = ? AND status = 'open'")
            .bind(&key.subscriber_id)
            .bind(&key.exchange_id)
            .bind(&key.symbol)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_position).transpose()
    }

    async fn count_open_for_subscriber(&self, subscriber_id: &str) -> anyhow::Result<u32> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM positions WHERE subscriber_id = ? AND status = 'open'")
            .bind(subscriber_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u32)
    }

    /// Includes `closing` rows alongside `open` ones so a position whose
    /// close order was submitted but never confirmed keeps getting scanned
    /// until the supervisor reconciles it to `closed`.
    async fn list_open_batch(&self, after_id: Option<&str>, limit: u32) -> anyhow::Result<Vec<Position>> {
        let rows = match after_id {
            Some(id) => {
                sqlx::query("SELECT * FROM positions WHERE status != 'closed' AND id > ? ORDER BY id ASC LIMIT ?")
                    .bind(id)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM positions WHERE status != 'closed' ORDER BY id ASC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_position).collect()
    }

    async fn list_open_for_subscriber(&self, subscriber_id: &str) -> anyhow::Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE subscriber_id = ? AND status = 'open'")
            .bind(subscriber_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_position).collect()
    }

    async fn upsert(&self, position: &Position) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, subscriber_id, exchange_id, credential_id, symbol, side, status,
                entry_price, quantity, tp_percent, sl_percent, tp_order_id, sl_order_id, dca_additions,
                last_addition_price, last_addition_qty, trailing_stop_armed,
                trailing_stop_high_water, opened_at, closed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                entry_price = excluded.entry_price,
                quantity = excluded.quantity,
                tp_order_id = excluded.tp_order_id,
                sl_order_id = excluded.sl_order_id,
                dca_additions = excluded.dca_additions,
                last_addition_price = excluded.last_addition_price,
                last_addition_qty = excluded.last_addition_qty,
                trailing_stop_armed = excluded.trailing_stop_armed,
                trailing_stop_high_water = excluded.trailing_stop_high_water,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(&position.id)
        .bind(&position.subscriber_id)
        .bind(&position.exchange_id)
        .bind(&position.credential_id)
        .bind(&position.symbol)
        .bind(side_to_str(position.side))
        .bind(status_to_str(position.status))
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.tp_percent)
        .bind(position.sl_percent)
        .bind(&position.tp_order_id)
        .bind(&position.sl_order_id)
        .bind(position.dca_additions as i64)
        .bind(position.last_addition_price)
        .bind(position.last_addition_qty)
        .bind(position.trailing_stop_armed as i64)
        .bind(position.trailing_stop_high_water)
        .bind(position.opened_at)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self, id: &str, closed_at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE positions SET status = 'closed', closed_at = ? WHERE id = ?").bind(closed_at).bind(id).execute(&self.pool).await?;
        Ok(())
    }
}
