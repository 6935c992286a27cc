//! Upstream client with endpoint failover

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use reqwest::{Client, Response};
use tokio::time::Duration;

use crate::error::ProxyError;
use crate::proxy::provider_pool::Endpoint;

/// A request ready to be sent to any endpoint of a provider.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Already filtered; `Authorization` is added per endpoint.
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What came back from the endpoint that accepted the request.
pub enum UpstreamReply {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Headers received; the body is still on the wire.
    Streaming(Response),
}

#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub request: Duration,
    pub stream: Duration,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http_client: Client,
    timeouts: UpstreamTimeouts,
}

impl UpstreamClient {
    pub fn new(timeouts: UpstreamTimeouts) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(timeouts.connect)
            .pool_max_idle_per_host(64)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            timeouts,
        })
    }

    pub fn build_url(base_url: &str, path: &str, query: Option<&str>) -> String {
        let base = base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        match query {
            Some(qs) if !qs.is_empty() => format!("{}/{}?{}", base, path, qs),
            _ => format!("{}/{}", base, path),
        }
    }

    fn bearer(api_key: &str) -> Result<HeaderValue, String> {
        HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| "endpoint credential is not a valid header value".to_string())
    }

    /// Send `request` to each candidate in order until one answers.
    ///
    /// Only transport failures (connect errors, timeouts, broken bodies while
    /// buffering) move on to the next candidate. Any HTTP response, whatever
    /// its status, is returned to the caller as-is.
    pub async fn send(
        &self,
        provider: usize,
        candidates: &[Endpoint],
        request: &OutboundRequest,
        streaming: bool,
        trace_id: &str,
    ) -> Result<(UpstreamReply, Endpoint), ProxyError> {
        let timeout = if streaming {
            self.timeouts.stream
        } else {
            self.timeouts.request
        };

        let mut last_err: Option<String> = None;
        let mut timed_out = false;

        for (idx, endpoint) in candidates.iter().enumerate() {
            let url = Self::build_url(&endpoint.base_url, &request.path, request.query.as_deref());

            let mut headers = request.headers.clone();
            match Self::bearer(&endpoint.api_key) {
                Ok(value) => {
                    headers.insert(header::AUTHORIZATION, value);
                }
                Err(e) => {
                    tracing::warn!("[{}] Skipping {}: {}", trace_id, endpoint.base_url, e);
                    last_err = Some(format!("{}: {}", endpoint.base_url, e));
                    timed_out = false;
                    continue;
                }
            }

            let mut builder = self
                .http_client
                .request(request.method.clone(), &url)
                .headers(headers)
                .timeout(timeout);
            if !request.body.is_empty() {
                builder = builder.body(request.body.clone());
            }

            tracing::debug!("[{}] {} {} (attempt {}/{})", trace_id, request.method, url, idx + 1, candidates.len());

            let response = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!("[{}] Request failed at {}: {}", trace_id, endpoint.base_url, e);
                    timed_out = e.is_timeout();
                    last_err = Some(format!("{}: {}", endpoint.base_url, e));
                    continue;
                }
            };

            if idx > 0 {
                tracing::info!("[{}] Upstream fallback succeeded: {} (attempt {})", trace_id, endpoint.base_url, idx + 1);
            }

            if streaming {
                return Ok((UpstreamReply::Streaming(response), endpoint.clone()));
            }

            let status = response.status();
            let headers = response.headers().clone();
            match response.bytes().await {
                Ok(body) => {
                    return Ok((
                        UpstreamReply::Buffered {
                            status,
                            headers,
                            body,
                        },
                        endpoint.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("[{}] Reading body from {} failed: {}", trace_id, endpoint.base_url, e);
                    timed_out = e.is_timeout();
                    last_err = Some(format!("{}: {}", endpoint.base_url, e));
                }
            }
        }

        tracing::error!("[{}] All {} endpoint(s) of provider {} failed", trace_id, candidates.len(), provider);

        Err(ProxyError::AllEndpointsFailed {
            provider,
            attempts: candidates.len(),
            last_error: last_err.unwrap_or_else(|| "no endpoints available".to_string()),
            timed_out,
        })
    }
}
