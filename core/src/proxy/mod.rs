//! Proxy module - transparent forwarding server

pub mod blocklist;
pub mod client_ip;
pub mod config;
pub mod forwarder;
pub mod handlers;
pub mod middleware;
pub mod provider_pool;
pub mod rate_limit;
pub mod relay;
pub mod router;
pub mod server;
pub mod upstream;

pub use config::ProxyConfig;
pub use provider_pool::{Endpoint, ProviderPool};
pub use rate_limit::{RateLimitSettings, RateLimiter};
pub use router::ProxyRouter;
pub use server::{build_app, AppState, ProxyServer};
