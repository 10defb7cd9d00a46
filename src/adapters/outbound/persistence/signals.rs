use async_trait::async_trait;
use sqlx::Row;

use super::Database;
use crate::domain::models::{Signal, SignalAction, SignalStatus};
use crate::ports::SignalRepository;

fn action_to_str(action: SignalAction) -> &'static str {
    match action {
        SignalAction::Long => "long",
        SignalAction::Short => "short",
        SignalAction::Close => "close",
    }
}

fn status_to_str(status: SignalStatus) -> &'static str {
    match status {
        SignalStatus::Received => "received",
        SignalStatus::Dispatched => "dispatched",
        SignalStatus::Terminal => "terminal",
    }
}

fn row_to_signal(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Signal> {
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    let overrides_json: String = row.try_get("overrides_json")?;
    Ok(Signal {
        signal_id: row.try_get("signal_id")?,
        strategy_id: row.try_get("strategy_id")?,
        symbol: row.try_get("symbol")?,
        action: SignalAction::parse(&action).unwrap_or(SignalAction::Close),
        overrides: serde_json::from_str(&overrides_json)?,
        received_at: row.try_get("received_at")?,
        status: match status.as_str() {
            "dispatched" => SignalStatus::Dispatched,
            "terminal" => SignalStatus::Terminal,
            _ => SignalStatus::Received,
        },
    })
}

#[async_trait]
impl SignalRepository for Database {
    async fn insert_if_new(&self, signal: &Signal) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (signal_id, strategy_id, symbol, action, overrides_json, received_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(signal_id) DO NOTHING
            "#,
        )
        .bind(&signal.signal_id)
        .bind(signal.strategy_id)
        .bind(&signal.symbol)
        .bind(action_to_str(signal.action))
        .bind(serde_json::to_string(&signal.overrides)?)
        .bind(signal.received_at)
        .bind(status_to_str(signal.status))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, signal_id: &str) -> anyhow::Result<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE signal_id = ?").bind(signal_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_signal).transpose()
    }

    async fn mark_dispatched(&self, signal_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE signals SET status = 'dispatched' WHERE signal_id = ?").bind(signal_id).execute(&self.pool).await?;
        Ok(())
    }
}
