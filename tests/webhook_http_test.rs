//! HTTP-layer coverage for the webhook endpoint: request/response shape,
//! passphrase rejection, and the per-source-IP rate limit, driven straight
//! through the axum `Router` with `tower::ServiceExt::oneshot` rather than
//! the service layer directly (spec §4.1, §6).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use dispatch_engine::adapters::inbound::http::{create_router, AppState, IpRateLimiter};
use dispatch_engine::application::SignalIntakeService;
use dispatch_engine::ports::{ClaimedJob, JobQueue, SignalRepository};

const PASSPHRASE: &str = "test-passphrase";

#[derive(Default)]
struct FakeSignalRepo {
    known: std::sync::Mutex<std::collections::HashSet<String>>,
}

#[async_trait]
impl SignalRepository for FakeSignalRepo {
    async fn insert_if_new(&self, signal: &dispatch_engine::domain::models::Signal) -> anyhow::Result<bool> {
        Ok(self.known.lock().unwrap().insert(signal.signal_id.clone()))
    }
    async fn find(&self, _signal_id: &str) -> anyhow::Result<Option<dispatch_engine::domain::models::Signal>> {
        Ok(None)
    }
    async fn mark_dispatched(&self, _signal_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeJobQueue;

#[async_trait]
impl JobQueue for FakeJobQueue {
    async fn enqueue(
        &self,
        _job_name: &str,
        _job_key: &str,
        _payload: serde_json::Value,
        _run_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    async fn claim_next(&self, _visibility_timeout: std::time::Duration) -> anyhow::Result<Option<ClaimedJob>> {
        Ok(None)
    }
    async fn complete(&self, _job_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn fail(&self, _job_id: &str, _retry_at: Option<chrono::DateTime<chrono::Utc>>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn app_state(burst_limit_per_minute: u32) -> AppState {
    let signal_intake = Arc::new(SignalIntakeService::new(
        PASSPHRASE.to_string(),
        Arc::new(FakeSignalRepo::default()),
        Arc::new(FakeJobQueue),
    ));
    AppState {
        signal_intake,
        allowed_origins: vec![],
        cors_disabled: true,
        webhook_rate_limiter: Arc::new(IpRateLimiter::new(burst_limit_per_minute)),
    }
}

fn client_addr() -> SocketAddr {
    "127.0.0.1:9999".parse().unwrap()
}

/// `ConnectInfo` normally arrives as a request extension inserted by
/// `into_make_service_with_connect_info` before hyper hands the request to
/// the router; `oneshot` bypasses that layer, so the test inserts the same
/// extension directly.
fn webhook_request(passphrase: &str, symbol: &str) -> Request<Body> {
    let body = json!({
        "passphrase": passphrase,
        "symbol": symbol,
        "action": "long",
        "risk_perc": 2.0,
        "leverage": 10,
        "tp_perc": 5.0,
        "sl_perc": 2.0,
    });
    let mut request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(client_addr()));
    request
}

#[tokio::test]
async fn valid_signal_is_accepted() {
    let router = create_router(app_state(30));
    let response = router.oneshot(webhook_request(PASSPHRASE, "BTCUSDT")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["duplicate"], false);
}

#[tokio::test]
async fn wrong_passphrase_is_forbidden() {
    let router = create_router(app_state(30));
    let response = router.oneshot(webhook_request("wrong", "BTCUSDT")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn burst_over_the_configured_limit_is_rate_limited() {
    let router = create_router(app_state(2));

    for _ in 0..2 {
        let response = router.clone().oneshot(webhook_request(PASSPHRASE, "BTCUSDT")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router.oneshot(webhook_request(PASSPHRASE, "BTCUSDT")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn healthz_is_reachable_without_a_passphrase() {
    let router = create_router(app_state(30));
    let mut request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    request.extensions_mut().insert(ConnectInfo(client_addr()));
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
