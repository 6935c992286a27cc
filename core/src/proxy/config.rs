//! Runtime proxy settings derived from the loaded [`Config`]

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::proxy::rate_limit::RateLimitSettings;
use crate::proxy::upstream::UpstreamTimeouts;

/// Silence on an event stream longer than this triggers a `: ping` comment.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Empty disables client authentication.
    pub auth_key: String,
    pub timeouts: UpstreamTimeouts,
    pub heartbeat_interval: Duration,
    pub rate_limit: RateLimitSettings,
    pub trust_proxy: bool,
    pub blocklist_file: Option<PathBuf>,
    pub active_provider: usize,
}

impl ProxyConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            auth_key: config.auth.api_key.clone(),
            timeouts: UpstreamTimeouts {
                connect: Duration::from_secs(config.timeouts.connect_timeout),
                request: Duration::from_secs(config.timeouts.request_timeout),
                stream: Duration::from_secs(config.timeouts.stream_timeout),
            },
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rate_limit: RateLimitSettings {
                enabled: config.rate_limit.enabled,
                requests_per_minute: config.rate_limit.requests_per_minute,
                burst_size: config.rate_limit.burst_size,
            },
            trust_proxy: config.rate_limit.trust_proxy,
            blocklist_file: config.rate_limit.blocklist_file.clone(),
            active_provider: config.routing.active_provider,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_enabled(&self) -> bool {
        !self.auth_key.is_empty()
    }
}
