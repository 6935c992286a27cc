//! Forwarding engine: classify, dispatch with failover, relay

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Method},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProxyError;
use crate::proxy::provider_pool::ProviderPool;
use crate::proxy::relay::{self, ErrorFraming, RelayGuard};
use crate::proxy::upstream::{OutboundRequest, UpstreamClient, UpstreamReply};

const EVENT_STREAM: &str = "text/event-stream";

/// Request headers never sent upstream. `cf-*` is matched by prefix separately.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
    "expect",
    "cdn-loop",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-server",
    "x-forwarded-port",
    "x-real-ip",
    "true-client-ip",
    "via",
    "forwarded",
];

/// Response headers the server recomputes for the client connection.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "transfer-encoding",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "upgrade",
    "te",
    "trailer",
];

/// An inbound request as seen by the router.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Deserialize)]
struct StreamFlag {
    #[serde(default)]
    stream: Option<FlagValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

impl FlagValue {
    fn is_truthy(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Number(n) => *n != 0.0,
            FlagValue::Text(s) => s.eq_ignore_ascii_case("true"),
            FlagValue::Other(_) => false,
        }
    }
}

/// Whether the body carries a truthy top-level `stream` flag.
/// Anything that is not a JSON object counts as `false`.
pub fn body_requests_stream(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    serde_json::from_slice::<StreamFlag>(body)
        .ok()
        .and_then(|flag| flag.stream)
        .map(|value| value.is_truthy())
        .unwrap_or(false)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(EVENT_STREAM))
}

pub fn is_streaming_request(headers: &HeaderMap, body: &[u8]) -> bool {
    accepts_event_stream(headers) || body_requests_stream(body)
}

/// Copy `headers` minus the outbound deny-list and every `cf-*` header.
pub fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, |name| {
        let name = name.as_str();
        !STRIPPED_REQUEST_HEADERS.contains(&name) && !name.starts_with("cf-")
    })
}

pub fn relayed_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, |name| !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()))
}

fn filter_headers<F>(headers: &HeaderMap, keep: F) -> HeaderMap
where
    F: Fn(&HeaderName) -> bool,
{
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if keep(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with(EVENT_STREAM))
        .unwrap_or(false)
}

fn trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct Forwarder {
    pool: Arc<ProviderPool>,
    upstream: UpstreamClient,
    heartbeat: Duration,
}

impl Forwarder {
    pub fn new(pool: Arc<ProviderPool>, upstream: UpstreamClient, heartbeat: Duration) -> Self {
        Self {
            pool,
            upstream,
            heartbeat,
        }
    }

    pub async fn forward(&self, request: InboundRequest, provider: usize) -> Result<Response, ProxyError> {
        let trace_id = trace_id();
        let streaming = is_streaming_request(&request.headers, &request.body);
        let framing = ErrorFraming::from_accept(&request.headers);

        let candidates = self.pool.next_candidates(provider)?;

        tracing::info!(
            "[{}] {} {} -> provider {} ({}, {} candidate(s))",
            trace_id,
            request.method,
            request.path,
            provider,
            if streaming { "stream" } else { "buffered" },
            candidates.len()
        );

        let outbound = OutboundRequest {
            method: request.method,
            path: request.path,
            query: request.query,
            headers: outbound_headers(&request.headers),
            body: request.body,
        };

        let (reply, endpoint) = self
            .upstream
            .send(provider, &candidates, &outbound, streaming, &trace_id)
            .await?;

        match reply {
            UpstreamReply::Buffered { status, headers, body } => {
                tracing::debug!("[{}] {} replied {} ({} bytes)", trace_id, endpoint.base_url, status, body.len());
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = relayed_headers(&headers);
                Ok(response)
            }
            UpstreamReply::Streaming(upstream) => {
                let status = upstream.status();
                let headers = relayed_headers(upstream.headers());
                let heartbeat = is_event_stream(&headers).then_some(self.heartbeat);

                tracing::debug!("[{}] {} replied {}, streaming", trace_id, endpoint.base_url, status);

                let guard = RelayGuard::new(trace_id, endpoint.base_url);
                let body = relay::relay(upstream.bytes_stream(), framing, heartbeat, guard);

                let mut response = Response::new(Body::from_stream(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                Ok(response)
            }
        }
    }
}
