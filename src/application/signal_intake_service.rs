use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::models::{canonicalize_symbol, compute_signal_id, Signal, SignalAction, SignalContent, SignalStatus};
use crate::domain::models::PartialTradingParams;
use crate::ports::{JobQueue, SignalRepository};

/// The validated shape of an inbound webhook body (spec §6 "Webhook").
/// HTTP-layer deserialization quirks (missing fields, wrong types) are the
/// caller's concern; by the time an `IntakeRequest` reaches this service its
/// shape is already sound, only its business-rule admissibility is checked.
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub passphrase: String,
    pub symbol: String,
    pub action: String,
    pub risk_perc: Option<f64>,
    pub leverage: Option<i64>,
    pub tp_perc: Option<f64>,
    pub sl_perc: Option<f64>,
    pub strategy_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Queued { signal_id: String, symbol: String, action: String },
    Duplicate { signal_id: String, symbol: String, action: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeRejection {
    PassphraseMismatch,
    SchemaInvalid(String),
}

pub struct SignalIntakeService {
    expected_passphrase: String,
    signals: Arc<dyn SignalRepository>,
    jobs: Arc<dyn JobQueue>,
}

impl SignalIntakeService {
    pub fn new(expected_passphrase: String, signals: Arc<dyn SignalRepository>, jobs: Arc<dyn JobQueue>) -> Self {
        Self { expected_passphrase, signals, jobs }
    }

    /// Spec §4.1 algorithm: validate, compute `signal_id`, insert
    /// `ON CONFLICT DO NOTHING`, enqueue only on first insert. Any failure
    /// downstream of a successful enqueue is not surfaced here (§4.1
    /// "Failure semantics") — by the time this returns `Queued`, the caller's
    /// contract is already satisfied.
    pub async fn ingest(&self, req: IntakeRequest) -> Result<IntakeOutcome, IntakeRejection> {
        if !constant_time_eq(req.passphrase.as_bytes(), self.expected_passphrase.as_bytes()) {
            return Err(IntakeRejection::PassphraseMismatch);
        }

        let action = SignalAction::parse(&req.action)
            .ok_or_else(|| IntakeRejection::SchemaInvalid(format!("unknown action '{}'", req.action)))?;

        if req.symbol.trim().is_empty() {
            return Err(IntakeRejection::SchemaInvalid("symbol must not be empty".into()));
        }
        let symbol = canonicalize_symbol(&req.symbol);
        if symbol.is_empty() {
            return Err(IntakeRejection::SchemaInvalid("symbol has no alphanumeric characters".into()));
        }

        validate_ranges(&req)?;

        let signal_id = compute_signal_id(&SignalContent {
            symbol: &symbol,
            action: &req.action.to_ascii_lowercase(),
            risk_perc: req.risk_perc,
            leverage: req.leverage,
            tp_perc: req.tp_perc,
            sl_perc: req.sl_perc,
            strategy_id: req.strategy_id,
        });

        let signal = Signal {
            signal_id: signal_id.clone(),
            strategy_id: req.strategy_id,
            symbol: symbol.clone(),
            action,
            overrides: PartialTradingParams {
                risk_fraction: req.risk_perc.map(|p| p / 100.0),
                leverage: req.leverage.map(|l| l as u32),
                tp_percent: req.tp_perc,
                sl_percent: req.sl_perc,
            },
            received_at: Utc::now(),
            status: SignalStatus::Received,
        };

        let action_str = req.action.to_ascii_lowercase();
        let created = self
            .signals
            .insert_if_new(&signal)
            .await
            .map_err(|e| IntakeRejection::SchemaInvalid(format!("storage error: {e}")))?;

        if !created {
            info!(signal_id = %signal_id, "duplicate webhook delivery, not re-dispatched");
            return Ok(IntakeOutcome::Duplicate { signal_id, symbol, action: action_str });
        }

        if let Err(e) = self
            .jobs
            .enqueue("execute_signal", &signal_id, serde_json::json!({ "signal_id": signal_id }), None)
            .await
        {
            warn!(signal_id = %signal_id, error = %e, "failed to enqueue execute_signal job; signal row is durable and will be retried by the supervisor");
        }

        Ok(IntakeOutcome::Queued { signal_id, symbol, action: action_str })
    }
}

fn validate_ranges(req: &IntakeRequest) -> Result<(), IntakeRejection> {
    if let Some(risk) = req.risk_perc {
        if !(0.0..=100.0).contains(&risk) {
            return Err(IntakeRejection::SchemaInvalid("risk_perc must be within [0, 100]".into()));
        }
    }
    if let Some(leverage) = req.leverage {
        if !(1..=125).contains(&leverage) {
            return Err(IntakeRejection::SchemaInvalid("leverage must be within [1, 125]".into()));
        }
    }
    if let Some(tp) = req.tp_perc {
        if tp < 0.0 {
            return Err(IntakeRejection::SchemaInvalid("tp_perc must be >= 0".into()));
        }
    }
    if let Some(sl) = req.sl_perc {
        if sl < 0.0 {
            return Err(IntakeRejection::SchemaInvalid("sl_perc must be >= 0".into()));
        }
    }
    Ok(())
}

/// Byte-length-revealing but timing-safe-per-byte comparison. The passphrase
/// length is not secret (it is operator-configured, not derived from the
/// request), so only the per-byte comparison needs to run in constant time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSignalRepo {
        known: Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl SignalRepository for FakeSignalRepo {
        async fn insert_if_new(&self, signal: &Signal) -> anyhow::Result<bool> {
            let mut known = self.known.lock().unwrap();
            Ok(known.insert(signal.signal_id.clone()))
        }
        async fn find(&self, _signal_id: &str) -> anyhow::Result<Option<Signal>> {
            Ok(None)
        }
        async fn mark_dispatched(&self, _signal_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeJobQueue {
        enqueued: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobQueue for FakeJobQueue {
        async fn enqueue(&self, _job_name: &str, job_key: &str, _payload: serde_json::Value, _run_at: Option<chrono::DateTime<Utc>>) -> anyhow::Result<()> {
            self.enqueued.lock().unwrap().push(job_key.to_string());
            Ok(())
        }
        async fn claim_next(&self, _visibility_timeout: std::time::Duration) -> anyhow::Result<Option<crate::ports::ClaimedJob>> {
            Ok(None)
        }
        async fn complete(&self, _job_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fail(&self, _job_id: &str, _retry_at: Option<chrono::DateTime<Utc>>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn service() -> (SignalIntakeService, Arc<FakeJobQueue>) {
        let jobs = Arc::new(FakeJobQueue::default());
        let svc = SignalIntakeService::new("secret".into(), Arc::new(FakeSignalRepo::default()), jobs.clone());
        (svc, jobs)
    }

    fn req() -> IntakeRequest {
        IntakeRequest {
            passphrase: "secret".into(),
            symbol: "btc-usdt".into(),
            action: "long".into(),
            risk_perc: Some(2.0),
            leverage: Some(10),
            tp_perc: Some(5.0),
            sl_perc: Some(2.0),
            strategy_id: None,
        }
    }

    #[tokio::test]
    async fn wrong_passphrase_is_rejected() {
        let (svc, _) = service();
        let mut bad = req();
        bad.passphrase = "wrong".into();
        assert_eq!(svc.ingest(bad).await, Err(IntakeRejection::PassphraseMismatch));
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_redispatch() {
        let (svc, jobs) = service();
        let first = svc.ingest(req()).await.unwrap();
        let second = svc.ingest(req()).await.unwrap();
        assert!(matches!(first, IntakeOutcome::Queued { .. }));
        assert!(matches!(second, IntakeOutcome::Duplicate { .. }));
        assert_eq!(jobs.enqueued.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leverage_out_of_range_is_rejected() {
        let (svc, _) = service();
        let mut bad = req();
        bad.leverage = Some(200);
        assert!(matches!(svc.ingest(bad).await, Err(IntakeRejection::SchemaInvalid(_))));
    }
}
