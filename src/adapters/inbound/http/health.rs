use axum::http::StatusCode;

/// `GET /healthz`. Liveness only — no dependency checks, so a database
/// hiccup doesn't flap the process out of a load balancer's rotation.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
