//! Generic outgoing-webhook notification sink, grounded on the Discord
//! webhook notifier pattern in `invest-iq`'s trading agent: POST a small
//! JSON payload to a fixed URL, log and swallow failures rather than
//! propagate them (spec §4.8 — a sink's failure never blocks the caller).

use async_trait::async_trait;
use tracing::warn;

use crate::ports::NotificationSink;

pub struct WebhookNotificationSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookNotificationSink {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder().timeout(std::time::Duration::from_secs(5)).build().expect("failed to build reqwest client");
        WebhookNotificationSink { name: name.into(), url: url.into(), client }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "subject": subject, "body": body });
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            warn!(sink = %self.name, %status, "notification webhook returned non-success status");
            anyhow::bail!("webhook {} returned {}", self.name, status);
        }
        Ok(())
    }
}
