//! Inbound HTTP adapter: the webhook endpoint and a liveness probe. Router
//! wiring (CORS, request tracing) follows the teacher's `api::create_router`.

mod dtos;
mod error;
mod health;
mod rate_limit;
mod webhook;

pub use error::{ApiResult, ProblemDetails};
pub use rate_limit::IpRateLimiter;

use std::sync::Arc;

use axum::{routing::{get, post}, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;

use crate::application::SignalIntakeService;

#[derive(Clone)]
pub struct AppState {
    pub signal_intake: Arc<SignalIntakeService>,
    pub allowed_origins: Vec<String>,
    pub cors_disabled: bool,
    pub webhook_rate_limiter: Arc<IpRateLimiter>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = if state.cors_disabled {
        tracing::warn!("CORS is DISABLED - allowing all origins. This should only be used in development!");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(state.allowed_origins.iter().filter_map(|origin| origin.parse().ok()).collect::<Vec<_>>())
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(tracing::Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG).latency_unit(LatencyUnit::Millis));

    Router::new()
        .route("/webhook", post(webhook::receive_signal))
        .route("/healthz", get(health::healthz))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
