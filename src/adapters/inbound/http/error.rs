//! RFC 9457 Problem Details, ported from the teacher's `api/error.rs`
//! (same shape, English copy instead of the original's Japanese comments).
//! <https://www.rfc-editor.org/rfc/rfc9457.html>

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    pub fn new(type_uri: impl Into<String>, title: impl Into<String>, status: StatusCode) -> Self {
        Self { type_uri: type_uri.into(), title: title.into(), status: status.as_u16(), detail: None, instance: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        let status = StatusCode::FORBIDDEN;
        Self::new("https://dispatch-engine.internal/errors/forbidden", status.canonical_reason().unwrap_or("Forbidden"), status).with_detail(detail)
    }

    pub fn validation_error(detail: impl Into<String>) -> Self {
        let status = StatusCode::BAD_REQUEST;
        Self::new("https://dispatch-engine.internal/errors/validation", status.canonical_reason().unwrap_or("Bad Request"), status).with_detail(detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        let status = StatusCode::TOO_MANY_REQUESTS;
        Self::new("https://dispatch-engine.internal/errors/rate-limited", status.canonical_reason().unwrap_or("Too Many Requests"), status)
            .with_detail(detail)
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        Self::new("https://dispatch-engine.internal/errors/internal", status.canonical_reason().unwrap_or("Internal Server Error"), status)
            .with_detail(detail)
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("application/problem+json"));
        response
    }
}

pub type ApiResult<T> = Result<T, ProblemDetails>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_has_403_status() {
        let problem = ProblemDetails::forbidden("bad passphrase");
        assert_eq!(problem.status, 403);
        assert_eq!(problem.detail.as_deref(), Some("bad passphrase"));
    }

    #[test]
    fn validation_error_has_400_status() {
        let problem = ProblemDetails::validation_error("bad symbol");
        assert_eq!(problem.status, 400);
    }
}
