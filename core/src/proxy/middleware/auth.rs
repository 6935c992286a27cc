//! Client bearer-token authentication

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ProxyError;
use crate::proxy::server::AppState;

/// `GET /` stays public so monitors can read the status snapshot.
fn is_public(method: &Method, path: &str) -> bool {
    method == Method::GET && path == "/"
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let scheme = value.get(..7)?;
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = value[7..].trim();
    (!token.is_empty()).then_some(token)
}

pub async fn auth_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.auth_key.is_empty() || is_public(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    match bearer_token(request.headers()) {
        Some(token) if token == &*state.auth_key => next.run(request).await,
        Some(_) => {
            tracing::warn!("Rejected {} {}: invalid bearer token", request.method(), request.uri().path());
            ProxyError::Unauthorized("invalid bearer token".to_string()).into_response()
        }
        None => {
            tracing::debug!("Rejected {} {}: missing bearer token", request.method(), request.uri().path());
            ProxyError::Unauthorized("missing bearer token".to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_auth(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&with_auth("Bearer secret")), Some("secret"));
        assert_eq!(bearer_token(&with_auth("bearer  secret ")), Some("secret"));
        assert_eq!(bearer_token(&with_auth("Basic abc")), None);
        assert_eq!(bearer_token(&with_auth("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_only_status_is_public() {
        assert!(is_public(&Method::GET, "/"));
        assert!(!is_public(&Method::POST, "/"));
        assert!(!is_public(&Method::POST, "/select"));
        assert!(!is_public(&Method::GET, "/v1/models"));
    }
}
