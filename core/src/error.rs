//! Error types for the routing core.
//!
//! Every error generated by the router itself renders as a JSON body of the
//! form `{"error": {"type": ..., "message": ...}}`. Upstream HTTP errors are
//! not represented here: they are relayed to the client verbatim.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Provider index outside `[0, count)`
    #[error("invalid provider index {index} (have {count} provider(s))")]
    InvalidProvider { index: usize, count: usize },

    /// Every endpoint of the provider failed at transport level
    #[error("all {attempts} endpoint(s) of provider {provider} failed: {last_error}")]
    AllEndpointsFailed {
        provider: usize,
        attempts: usize,
        last_error: String,
        timed_out: bool,
    },

    #[error("rate limit exceeded, retry after {retry_after_secs:.2}s")]
    RateLimited {
        retry_after_secs: f64,
        limit_per_minute: u32,
        burst_size: u32,
    },

    #[error("client {identity} is blocked")]
    Blocked { identity: String },

    #[error("{0}")]
    Unauthorized(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidProvider { .. } => StatusCode::BAD_REQUEST,
            ProxyError::AllEndpointsFailed { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::AllEndpointsFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Blocked { .. } => StatusCode::FORBIDDEN,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Machine-readable tag placed in `error.type`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidProvider { .. } => "invalid_provider",
            ProxyError::AllEndpointsFailed { .. } => "all_endpoints_failed",
            ProxyError::RateLimited { .. } => "rate_limit_exceeded",
            ProxyError::Blocked { .. } => "blocked",
            ProxyError::Unauthorized(_) => "unauthorized",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        let mut error = json!({
            "type": self.kind(),
            "message": message,
        });

        if let ProxyError::RateLimited {
            retry_after_secs,
            limit_per_minute,
            burst_size,
        } = &self
        {
            error["limit_per_minute"] = json!(limit_per_minute);
            error["burst_size"] = json!(burst_size);
            error["retry_after_seconds"] = json!(retry_after_secs);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        if let ProxyError::RateLimited { retry_after_secs, .. } = &self {
            let secs = retry_after_secs.ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
