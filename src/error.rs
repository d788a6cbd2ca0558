//! Unified gateway error type.
//!
//! Every component in the request pipeline (auth, quota, routing, breaker,
//! upstream) returns its own narrow error, which folds into `GatewayError`.
//! The orchestrator is the only place that turns a `GatewayError` into an
//! HTTP response, per the propagation policy in the design notes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing authorization header")]
    AuthMissing,
    #[error("malformed bearer token")]
    AuthBadFormat,
    #[error("api key revoked")]
    AuthRevoked,

    #[error("daily quota exceeded")]
    QuotaExceeded { limit: u32, remaining: u32, reset_at: chrono::DateTime<chrono::Utc> },

    #[error("concurrent stream limit exceeded")]
    ConcurrencyExceeded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("circuit breaker open for '{0}'")]
    BreakerOpen(String),

    #[error("upstream returned http error {status}")]
    UpstreamHttpError { status: u16, body: String },

    #[error("upstream unavailable")]
    UpstreamUnavailable,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl GatewayError {
    /// The HTTP status this error surfaces as, per the error handling table.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthBadFormat | GatewayError::AuthRevoked => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::QuotaExceeded { .. } | GatewayError::ConcurrencyExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::BreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamHttpError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthBadFormat | GatewayError::AuthRevoked => {
                "authentication_error"
            }
            GatewayError::QuotaExceeded { .. } | GatewayError::ConcurrencyExceeded => {
                "rate_limit_error"
            }
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::BreakerOpen(_) => "server_error",
            GatewayError::UpstreamHttpError { .. } | GatewayError::UpstreamUnavailable => {
                "upstream_error"
            }
            GatewayError::Internal(_) => "server_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthBadFormat | GatewayError::AuthRevoked => {
                Some("invalid_api_key")
            }
            _ => None,
        }
    }

    /// The client-facing message. Most variants surface their `Display`
    /// text verbatim; `InvalidRequest` surfaces its inner reason directly
    /// instead of prefixing `"invalid request: "`, since that reason is
    /// itself a complete, client-facing sentence (e.g. the direct-mode
    /// allowlist message).
    fn message(&self) -> String {
        match self {
            GatewayError::InvalidRequest(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(ErrorBody {
            error: ErrorDetail {
                message: self.message(),
                kind: self.error_type(),
                param: None,
                code: self.code(),
            },
        })
        .unwrap_or_else(|_| serde_json::json!({"error": {"message": "internal error"}}))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if !matches!(self, GatewayError::Internal(_)) {
            tracing::warn!(error = %self, status = %status, "request failed");
        } else {
            tracing::error!(error = %self, "internal error");
        }

        let mut response = (status, Json(self.to_body())).into_response();
        if let GatewayError::QuotaExceeded { limit, remaining, reset_at } = &self {
            let headers = response.headers_mut();
            if let Ok(value) = limit.to_string().parse() {
                headers.insert("x-ratelimit-limit", value);
            }
            if let Ok(value) = remaining.to_string().parse() {
                headers.insert("x-ratelimit-remaining", value);
            }
            if let Ok(value) = reset_at.to_rfc3339().parse() {
                headers.insert("x-ratelimit-reset", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_body_surfaces_the_reason_verbatim() {
        let err = GatewayError::InvalidRequest(
            "Model 'M_c' is not allowed in direct mode. Allowed models: M_a, M_b.".to_string(),
        );
        let body = err.to_body();
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.starts_with("Model 'M_c' is not allowed in direct mode."));
        assert!(!message.starts_with("invalid request:"));
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[test]
    fn other_variants_still_use_their_display_text() {
        let err = GatewayError::AuthMissing;
        assert_eq!(err.to_body()["error"]["message"], "missing authorization header");
    }
}
