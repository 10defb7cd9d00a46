use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{instrument, warn};

use crate::domain::models::BalanceSnapshot;
use crate::ports::{BalanceSnapshotRepository, CredentialRepository, CredentialStore, ExchangeAdapter, SubscriberRepository};

/// Backs the periodic `record_balance_snapshots()` job (spec §4.2). The
/// first snapshot taken on a new UTC day anchors `day_start_equity`, which
/// the Position Supervisor's guardrail check measures drawdown against.
pub struct BalanceSnapshotRecorder {
    pub subscribers: Arc<dyn SubscriberRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub balance_snapshots: Arc<dyn BalanceSnapshotRepository>,
    pub exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
}

impl BalanceSnapshotRecorder {
    #[instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let subscribers = self.subscribers.list_active().await?;
        for subscriber in subscribers {
            let credentials = self.credentials.list_for_subscriber(&subscriber.id).await?;
            for credential in credentials.into_iter().filter(|c| c.is_usable()) {
                if let Err(e) = self.record_one(&subscriber.id, &credential.id, &credential.exchange_id).await {
                    warn!(subscriber_id = %subscriber.id, exchange_id = %credential.exchange_id, error = %e, "failed to record balance snapshot, continuing");
                }
            }
        }
        Ok(())
    }

    async fn record_one(&self, subscriber_id: &str, credential_id: &str, exchange_id: &str) -> anyhow::Result<()> {
        let exchange = match self.exchanges.get(exchange_id) {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        let plaintext = self.credential_store.get_plaintext(credential_id).await?;
        let balance = exchange.fetch_balance(&plaintext).await?;

        let day_start_equity = match self.balance_snapshots.day_start_equity(subscriber_id, exchange_id).await? {
            Some(existing) => existing,
            None => balance.equity,
        };

        self.balance_snapshots
            .record(&BalanceSnapshot {
                subscriber_id: subscriber_id.to_string(),
                exchange_id: exchange_id.to_string(),
                taken_at: Utc::now(),
                equity: balance.equity,
                day_start_equity,
            })
            .await?;
        Ok(())
    }
}
