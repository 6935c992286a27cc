//! Shared helpers for router integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use cil_router_core::config::{Config, EndpointConfig, ProviderConfig};
use cil_router_core::proxy::{build_app, AppState, ProxyRouter};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

/// Address that refuses connections.
pub const DEAD_ENDPOINT: &str = "http://127.0.0.1:1";

pub fn provider(endpoints: &[(&str, &str)]) -> ProviderConfig {
    ProviderConfig {
        endpoints: endpoints
            .iter()
            .map(|(base_url, api_key)| EndpointConfig {
                base_url: base_url.to_string(),
                api_key: api_key.to_string(),
            })
            .collect(),
    }
}

pub fn config(providers: Vec<ProviderConfig>) -> Config {
    let mut config = Config::default();
    config.providers = providers;
    config.timeouts.connect_timeout = 2;
    config.timeouts.request_timeout = 5;
    config.timeouts.stream_timeout = 5;
    config
}

pub async fn app(config: &Config) -> (Router, Arc<ProxyRouter>) {
    let router = Arc::new(ProxyRouter::from_config(config).await.unwrap());
    let app = build_app(AppState::new(Arc::clone(&router), &config.auth.api_key));
    (app, router)
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
