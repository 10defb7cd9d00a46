use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    Json,
};
use serde::Serialize;

use crate::application::{IntakeOutcome, IntakeRejection, IntakeRequest};

use super::dtos::WebhookSignalRequest;
use super::error::{ApiResult, ProblemDetails};
use super::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAcceptedResponse {
    pub signal_id: String,
    pub symbol: String,
    pub action: String,
    pub duplicate: bool,
}

/// `POST /webhook`, spec §4.1/§6. Per-source-IP rate limiting is checked
/// first so an abusive caller never reaches the passphrase comparison;
/// everything past that is entirely the `SignalIntakeService`'s concern,
/// this handler only maps its outcome onto an HTTP status.
pub async fn receive_signal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<WebhookSignalRequest>,
) -> ApiResult<Json<WebhookAcceptedResponse>> {
    if let Err(retry_after_secs) = state.webhook_rate_limiter.check(&addr.ip().to_string()).await {
        return Err(ProblemDetails::rate_limited(format!("retry after {retry_after_secs}s")));
    }

    let request = IntakeRequest {
        passphrase: body.passphrase,
        symbol: body.symbol,
        action: body.action,
        risk_perc: body.risk_perc,
        leverage: body.leverage,
        tp_perc: body.tp_perc,
        sl_perc: body.sl_perc,
        strategy_id: body.strategy_id,
    };

    match state.signal_intake.ingest(request).await {
        Ok(IntakeOutcome::Queued { signal_id, symbol, action }) => Ok(Json(WebhookAcceptedResponse { signal_id, symbol, action, duplicate: false })),
        Ok(IntakeOutcome::Duplicate { signal_id, symbol, action }) => Ok(Json(WebhookAcceptedResponse { signal_id, symbol, action, duplicate: true })),
        Err(IntakeRejection::PassphraseMismatch) => Err(ProblemDetails::forbidden("webhook passphrase did not match")),
        Err(IntakeRejection::SchemaInvalid(detail)) => Err(ProblemDetails::validation_error(detail)),
    }
}
