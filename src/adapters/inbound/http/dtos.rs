use serde::Deserialize;

/// Inbound webhook body, spec §4.1/§6. Mirrors `IntakeRequest` field for
/// field; kept separate so the application layer never depends on an axum
/// type.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSignalRequest {
    pub passphrase: String,
    pub symbol: String,
    pub action: String,
    #[serde(default)]
    pub risk_perc: Option<f64>,
    #[serde(default)]
    pub leverage: Option<i64>,
    #[serde(default)]
    pub tp_perc: Option<f64>,
    #[serde(default)]
    pub sl_perc: Option<f64>,
    #[serde(default)]
    pub strategy_id: Option<i64>,
}
