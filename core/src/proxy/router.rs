//! Composition root: admission, provider selection and forwarding

use axum::http::HeaderValue;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::error::ProxyError;
use crate::proxy::blocklist::Blocklist;
use crate::proxy::client_ip;
use crate::proxy::config::ProxyConfig;
use crate::proxy::forwarder::{Forwarder, InboundRequest};
use crate::proxy::provider_pool::{ActiveProvider, ProviderInfo, ProviderPool};
use crate::proxy::rate_limit::{Admission, RateLimiter};
use crate::proxy::upstream::UpstreamClient;

pub const NAME: &str = "CIL Router";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of [`ProxyRouter::select_provider`].
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub success: bool,
    pub message: String,
    pub current: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub trust_proxy: bool,
    pub active_buckets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub name: &'static str,
    pub version: &'static str,
    pub active_provider: usize,
    pub provider_count: usize,
    pub endpoint_count: usize,
    pub endpoints: Vec<String>,
    pub providers: Vec<ProviderInfo>,
    pub rate_limit: RateLimitStatus,
    pub started_at: DateTime<Utc>,
}

pub struct ProxyRouter {
    pool: Arc<ProviderPool>,
    active: ActiveProvider,
    limiter: Arc<RateLimiter>,
    blocklist: Arc<Blocklist>,
    forwarder: Forwarder,
    trust_proxy: bool,
    started_at: DateTime<Utc>,
}

impl ProxyRouter {
    pub fn new(
        pool: Arc<ProviderPool>,
        active_provider: usize,
        limiter: Arc<RateLimiter>,
        blocklist: Arc<Blocklist>,
        forwarder: Forwarder,
        trust_proxy: bool,
    ) -> anyhow::Result<Self> {
        if active_provider >= pool.len() {
            anyhow::bail!(
                "Active provider index {} out of range (have {} provider(s))",
                active_provider,
                pool.len()
            );
        }

        Ok(Self {
            pool,
            active: ActiveProvider::new(active_provider),
            limiter,
            blocklist,
            forwarder,
            trust_proxy,
            started_at: Utc::now(),
        })
    }

    /// Build every component from a validated [`Config`].
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let settings = ProxyConfig::from_config(config);
        let pool = Arc::new(ProviderPool::from_config(&config.providers)?);
        let upstream = UpstreamClient::new(settings.timeouts)?;
        let forwarder = Forwarder::new(Arc::clone(&pool), upstream, settings.heartbeat_interval);

        let blocklist = match &settings.blocklist_file {
            Some(path) => Blocklist::load(path.clone()).await,
            None => Blocklist::empty(),
        };

        Self::new(
            pool,
            settings.active_provider,
            Arc::new(RateLimiter::new(settings.rate_limit)),
            Arc::new(blocklist),
            forwarder,
            settings.trust_proxy,
        )
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn active_provider(&self) -> usize {
        self.active.get()
    }

    /// Admit the caller, then forward to the active provider.
    pub async fn route(&self, request: InboundRequest) -> Result<Response, ProxyError> {
        let identity = client_ip::resolve(&request.headers, request.remote_addr, self.trust_proxy);

        if self.blocklist.contains(&identity) {
            tracing::warn!("Rejected blocked client {}", identity);
            return Err(ProxyError::Blocked { identity });
        }

        let settings = self.limiter.settings();
        let remaining = match self.limiter.admit(&identity) {
            Admission::Allowed { remaining } => remaining,
            Admission::Denied { retry_after_secs } => {
                return Err(ProxyError::RateLimited {
                    retry_after_secs,
                    limit_per_minute: settings.requests_per_minute,
                    burst_size: settings.burst_size,
                });
            }
        };

        let mut response = self.forwarder.forward(request, self.active.get()).await?;

        if let Some(remaining) = remaining {
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(settings.requests_per_minute));
            headers.insert("x-ratelimit-burst", HeaderValue::from(settings.burst_size));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining.floor() as u64));
        }

        Ok(response)
    }

    /// Switch the active provider. An out-of-range index leaves it unchanged.
    pub fn select_provider(&self, index: usize) -> Selection {
        let total = self.pool.len();

        if index >= total {
            tracing::warn!("Rejected provider switch to {} (have {})", index, total);
            return Selection {
                success: false,
                message: format!("invalid provider index {} (valid range 0..{})", index, total),
                current: self.active.get(),
                total,
                provider: None,
            };
        }

        let previous = loop {
            let current = self.active.get();
            if current == index || self.active.compare_and_set(current, index) {
                break current;
            }
        };

        tracing::info!("Active provider switched {} -> {}", previous, index);

        Selection {
            success: true,
            message: format!("switched to provider {}", index),
            current: index,
            total,
            provider: self.pool.info(index).ok(),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let active = self.active.get();
        let (endpoint_count, endpoints) = match self.pool.info(active) {
            Ok(info) => (info.endpoint_count, info.endpoints),
            Err(_) => (0, Vec::new()),
        };
        let stats = self.limiter.stats();

        StatusSnapshot {
            name: NAME,
            version: VERSION,
            active_provider: active,
            provider_count: self.pool.len(),
            endpoint_count,
            endpoints,
            providers: self.pool.all_info(),
            rate_limit: RateLimitStatus {
                enabled: stats.enabled,
                requests_per_minute: stats.requests_per_minute,
                burst_size: stats.burst_size,
                trust_proxy: self.trust_proxy,
                active_buckets: stats.active_buckets,
            },
            started_at: self.started_at,
        }
    }
}
