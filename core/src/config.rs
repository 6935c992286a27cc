use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Bearer token clients must present. Empty disables authentication.
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            stream_timeout: default_stream_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    #[serde(default = "default_trust_proxy")]
    pub trust_proxy: bool,

    #[serde(default)]
    pub blocklist_file: Option<PathBuf>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
            trust_proxy: default_trust_proxy(),
            blocklist_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub active_provider: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            timeouts: TimeoutsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
            routing: RoutingConfig::default(),
            providers: Vec::new(),
        }
    }
}

// Default value functions
fn default_port() -> u16 { 8000 }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_request_timeout() -> u64 { 60 }
fn default_stream_timeout() -> u64 { 120 }
fn default_connect_timeout() -> u64 { 10 }
fn default_requests_per_minute() -> u32 { 100 }
fn default_burst_size() -> u32 { 10 }
fn default_trust_proxy() -> bool { true }
fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Overlay process environment variables on top of the file configuration.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::apply_env`] but reads variables through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(key) = lookup("AUTH_KEY") {
            self.auth.api_key = key.trim().to_string();
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT") {
            self.timeouts.request_timeout = parse_seconds("REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("STREAM_TIMEOUT") {
            self.timeouts.stream_timeout = parse_seconds("STREAM_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse_bool("RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_RPM") {
            self.rate_limit.requests_per_minute = parse_env("RATE_LIMIT_RPM", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_BURST") {
            self.rate_limit.burst_size = parse_env("RATE_LIMIT_BURST", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_TRUST_PROXY") {
            self.rate_limit.trust_proxy = parse_bool("RATE_LIMIT_TRUST_PROXY", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_BLOCKLIST") {
            let v = v.trim();
            self.rate_limit.blocklist_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v.trim().to_lowercase();
        }
        if let Some(v) = lookup("CURRENT_PROVIDER_INDEX") {
            self.routing.active_provider = parse_env("CURRENT_PROVIDER_INDEX", &v)?;
        }

        let providers = providers_from_env(&lookup)?;
        if !providers.is_empty() {
            tracing::debug!("Loaded {} provider(s) from environment", providers.len());
            self.providers = providers;
        }

        Ok(())
    }

    /// Check the invariants the router relies on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("No providers configured (set [[providers]] or PROVIDER_0_BASE_URL / PROVIDER_0_API_KEY)");
        }

        for (index, provider) in self.providers.iter().enumerate() {
            if provider.endpoints.is_empty() {
                anyhow::bail!("Provider {} has no endpoints", index);
            }
            for endpoint in &provider.endpoints {
                let url = endpoint.base_url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    anyhow::bail!("Provider {} has invalid base_url {:?}: expected http(s) URL", index, url);
                }
                if url.parse::<reqwest::Url>().is_err() {
                    anyhow::bail!("Provider {} has unparseable base_url {:?}", index, url);
                }
            }
        }

        if self.routing.active_provider >= self.providers.len() {
            anyhow::bail!(
                "Active provider index {} out of range (have {} provider(s))",
                self.routing.active_provider,
                self.providers.len()
            );
        }

        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_minute == 0 {
                anyhow::bail!("rate_limit.requests_per_minute must be at least 1");
            }
            if self.rate_limit.burst_size == 0 {
                anyhow::bail!("rate_limit.burst_size must be at least 1");
            }
        }

        if self.timeouts.request_timeout == 0
            || self.timeouts.stream_timeout == 0
            || self.timeouts.connect_timeout == 0
        {
            anyhow::bail!("Timeouts must be at least 1 second");
        }

        Ok(())
    }
}

/// Read `PROVIDER_{N}_BASE_URL` / `PROVIDER_{N}_API_KEY` pairs until the first gap.
fn providers_from_env<F>(lookup: &F) -> anyhow::Result<Vec<ProviderConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut providers = Vec::new();

    for index in 0.. {
        let urls = lookup(&format!("PROVIDER_{}_BASE_URL", index));
        let keys = lookup(&format!("PROVIDER_{}_API_KEY", index));

        let (urls, keys) = match (urls, keys) {
            (Some(u), Some(k)) if !u.trim().is_empty() && !k.trim().is_empty() => (u, k),
            _ => break,
        };

        let urls = split_list(&urls);
        let keys = split_list(&keys);
        if urls.len() != keys.len() {
            anyhow::bail!(
                "PROVIDER_{} has {} base URL(s) but {} API key(s)",
                index,
                urls.len(),
                keys.len()
            );
        }

        let endpoints = urls
            .into_iter()
            .zip(keys)
            .map(|(base_url, api_key)| EndpointConfig { base_url, api_key })
            .collect();
        providers.push(ProviderConfig { endpoints });
    }

    Ok(providers)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", name, value, e))
}

/// Accepts fractional seconds, rounded up to whole seconds.
fn parse_seconds(name: &str, value: &str) -> anyhow::Result<u64> {
    let secs: f64 = parse_env(name, value)?;
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("Invalid value for {}: {:?}", name, value);
    }
    Ok(secs.ceil() as u64)
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => anyhow::bail!("Invalid boolean for {}: {:?}", name, value),
    }
}

/// Get default config file path
/// Uses ~/.config/cil-router/config.toml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("cil-router")
        .join("config.toml")
}

/// Load config from file (or defaults), then overlay the environment and validate.
///
/// Loading order:
/// 1. Specified path (if provided)
/// 2. ./config.toml (if exists)
/// 3. default_config_path() (usually ~/.config/cil-router/config.toml)
pub fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = load_config_file(path)?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the file layer only.
///
/// A broken `./config.toml` is skipped with a warning. Callers that load
/// before the subscriber is installed should load again afterwards so the
/// warning is not lost.
pub fn load_config_file(path: Option<PathBuf>) -> anyhow::Result<Config> {
    if let Some(config_path) = path {
        if config_path.exists() {
            let config = read_config(&config_path)?;
            tracing::info!("Loaded config from specified path {:?}", config_path);
            return Ok(config);
        } else {
            anyhow::bail!("Specified config file not found: {:?}", config_path);
        }
    }

    // Try current directory config.toml
    let local_config = PathBuf::from("config.toml");
    if local_config.exists() {
        match read_config(&local_config) {
            Ok(config) => {
                tracing::info!("Loaded config from current directory {:?}", local_config);
                return Ok(config);
            }
            Err(e) => {
                tracing::warn!("{:#}. Falling back to default path.", e);
            }
        }
    }

    let default_path = default_config_path();
    if default_path.exists() {
        let config = read_config(&default_path)?;
        tracing::info!("Loaded config from default path {:?}", default_path);
        Ok(config)
    } else {
        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }
}

/// Mask a credential for display.
pub fn mask_key(key: &str) -> String {
    if key.chars().count() > 8 {
        format!("{}...", key.chars().take(8).collect::<String>())
    } else {
        "***".to_string()
    }
}
