use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Database;
use crate::domain::models::{Subscriber, SubscriberRole, TradingParams};
use crate::ports::SubscriberRepository;

fn row_to_subscriber(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Subscriber> {
    let role: String = row.try_get("role")?;
    let params_json: String = row.try_get("params_json")?;
    let strategies_json: String = row.try_get("strategy_subscriptions_json")?;
    Ok(Subscriber {
        id: row.try_get("id")?,
        role: match role.as_str() {
            "receives_and_emits_signals" => SubscriberRole::ReceivesAndEmitsSignals,
            _ => SubscriberRole::ReceivesSignals,
        },
        active: row.try_get::<i64, _>("active")? != 0,
        subscription_expires_at: row.try_get("subscription_expires_at")?,
        params: serde_json::from_str::<TradingParams>(&params_json)?,
        guardrail_paused_until: row.try_get("guardrail_paused_until")?,
        strategy_subscriptions: serde_json::from_str(&strategies_json)?,
    })
}

#[async_trait]
impl SubscriberRepository for Database {
    async fn find(&self, subscriber_id: &str) -> anyhow::Result<Option<Subscriber>> {
        let row = sqlx::query("SELECT * FROM subscribers WHERE id = ?").bind(subscriber_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_subscriber).transpose()
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Subscriber>> {
        let rows = sqlx::query("SELECT * FROM subscribers WHERE active = 1").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_subscriber).collect()
    }

    async fn save(&self, subscriber: &Subscriber) -> anyhow::Result<()> {
        let role = match subscriber.role {
            SubscriberRole::ReceivesSignals => "receives_signals",
            SubscriberRole::ReceivesAndEmitsSignals => "receives_and_emits_signals",
        };
        sqlx::query(
            r#"
            INSERT INTO subscribers (id, role, active, subscription_expires_at, params_json, guardrail_paused_until, strategy_subscriptions_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                active = excluded.active,
                subscription_expires_at = excluded.subscription_expires_at,
                params_json = excluded.params_json,
                guardrail_paused_until = excluded.guardrail_paused_until,
                strategy_subscriptions_json = excluded.strategy_subscriptions_json
            "#,
        )
        .bind(&subscriber.id)
        .bind(role)
        .bind(subscriber.active as i64)
        .bind(subscriber.subscription_expires_at)
        .bind(serde_json::to_string(&subscriber.params)?)
        .bind(subscriber.guardrail_paused_until)
        .bind(serde_json::to_string(&subscriber.strategy_subscriptions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_guardrail_paused_until(&self, subscriber_id: &str, until: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        sqlx::query("UPDATE subscribers SET guardrail_paused_until = ? WHERE id = ?").bind(until).bind(subscriber_id).execute(&self.pool).await?;
        Ok(())
    }
}
