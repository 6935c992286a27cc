// Catch-all forwarding handler

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, Uri},
    response::Response,
};
use bytes::Bytes;

use crate::error::ProxyError;
use crate::proxy::forwarder::InboundRequest;
use crate::proxy::server::AppState;

pub async fn forward(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let request = InboundRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
        remote_addr: connect_info.map(|ConnectInfo(addr)| addr),
    };

    state.router.route(request).await
}
