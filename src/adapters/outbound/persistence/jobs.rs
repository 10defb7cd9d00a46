use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use std::time::Duration;

use super::Database;
use crate::ports::{ClaimedJob, JobQueue};

#[async_trait]
impl JobQueue for Database {
    async fn enqueue(&self, job_name: &str, job_key: &str, payload: serde_json::Value, run_at: Option<chrono::DateTime<Utc>>) -> anyhow::Result<()> {
        let run_at = run_at.unwrap_or_else(Utc::now);
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_name, job_key, payload_json, run_at, visible_at, attempt, status)
            VALUES (?, ?, ?, ?, ?, ?, 0, 'pending')
            ON CONFLICT(job_name, job_key) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(job_name)
        .bind(job_key)
        .bind(serde_json::to_string(&payload)?)
        .bind(run_at)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next(&self, visibility_timeout: Duration) -> anyhow::Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let candidate = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE run_at <= ? AND (status = 'pending' OR (status = 'in_flight' AND visible_at <= ?))
            ORDER BY run_at ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = candidate else { return Ok(None) };
        let id: String = row.try_get("id")?;
        let new_visible_at = now + chrono::Duration::from_std(visibility_timeout).unwrap_or(chrono::Duration::seconds(60));

        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'in_flight', visible_at = ?, attempt = attempt + 1
            WHERE id = ? AND run_at <= ? AND (status = 'pending' OR (status = 'in_flight' AND visible_at <= ?))
            "#,
        )
        .bind(new_visible_at)
        .bind(&id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race to another worker between select and update.
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?").bind(&id).fetch_one(&self.pool).await?;
        Ok(Some(ClaimedJob {
            id: row.try_get("id")?,
            job_name: row.try_get("job_name")?,
            payload: serde_json::from_str(&row.try_get::<String, _>("payload_json")?)?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
        }))
    }

    async fn complete(&self, job_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = 'done' WHERE id = ?").bind(job_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, retry_at: Option<chrono::DateTime<Utc>>) -> anyhow::Result<()> {
        match retry_at {
            Some(retry_at) => {
                sqlx::query("UPDATE jobs SET status = 'pending', run_at = ?, visible_at = ? WHERE id = ?")
                    .bind(retry_at)
                    .bind(retry_at)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("UPDATE jobs SET status = 'dead' WHERE id = ?").bind(job_id).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}
