pub mod audit_events;
pub mod balance_snapshots;
pub mod credentials;
pub mod execution_attempts;
pub mod jobs;
pub mod positions;
pub mod signals;
pub mod subscribers;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Owns the connection pool and applies the schema idempotently on
/// startup, mirroring the teacher's `Database::new` pattern of
/// `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS` run inline
/// rather than through a migrations framework.
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(10).connect(database_url).await.context("failed to connect to database")?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscribers (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                active INTEGER NOT NULL,
                subscription_expires_at TEXT NOT NULL,
                params_json TEXT NOT NULL,
                guardrail_paused_until TEXT,
                strategy_subscriptions_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                subscriber_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                status TEXT NOT NULL,
                active INTEGER NOT NULL,
                last_error TEXT,
                ciphertext BLOB NOT NULL,
                nonce BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_credentials_subscriber ON credentials(subscriber_id, exchange_id);").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                signal_id TEXT PRIMARY KEY,
                strategy_id INTEGER,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                overrides_json TEXT NOT NULL,
                received_at TEXT NOT NULL,
                status TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_signals_signal_id ON signals(signal_id);").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_attempts (
                id TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                subscriber_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT,
                order_id TEXT,
                filled_quantity REAL,
                filled_price REAL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_signal_subscriber ON execution_attempts(signal_id, subscriber_id);").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attempts_signal ON execution_attempts(signal_id);").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                subscriber_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                credential_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                tp_percent REAL NOT NULL DEFAULT 0,
                sl_percent REAL NOT NULL DEFAULT 0,
                tp_order_id TEXT,
                sl_order_id TEXT,
                dca_additions INTEGER NOT NULL,
                last_addition_price REAL NOT NULL,
                last_addition_qty REAL NOT NULL,
                trailing_stop_armed INTEGER NOT NULL,
                trailing_stop_high_water REAL,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_unique ON positions(subscriber_id, exchange_id, symbol, side) WHERE status != 'closed';",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_subscriber_status ON positions(subscriber_id, status);").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_snapshots (
                subscriber_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                taken_at TEXT NOT NULL,
                equity REAL NOT NULL,
                day_start_equity REAL NOT NULL,
                day TEXT NOT NULL,
                PRIMARY KEY (subscriber_id, exchange_id, day)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                subscriber_id TEXT,
                signal_id TEXT,
                detail_json TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_subscriber_instant ON audit_events(subscriber_id, occurred_at DESC);").execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                job_key TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                run_at TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_key ON jobs(job_name, job_key);").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_claimable ON jobs(status, run_at);").execute(&self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::JobQueue;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }

    /// `sqlite::memory:` covers every other test in this crate; this one
    /// exercises the on-disk path so a schema change that only breaks file
    /// persistence (e.g. a migration that isn't actually idempotent against
    /// an existing file) doesn't slip through unnoticed.
    #[tokio::test]
    async fn jobs_enqueued_before_reopen_are_claimable_after() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dispatch.sqlite");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        {
            let db = Database::new(&url).await.unwrap();
            db.enqueue("execute_signal", "sig-1", serde_json::json!({ "signal_id": "sig-1" }), None).await.unwrap();
        }

        let reopened = Database::new(&url).await.unwrap();
        let claimed = reopened.claim_next(std::time::Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().job_name, "execute_signal");
    }
}
