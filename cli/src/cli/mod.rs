pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cil_router_core::config::{load_config_file, Config};

#[derive(Parser)]
#[command(name = "cil-router")]
#[command(author, version, about = "Transparent API forwarder with endpoint failover and per-client rate limiting")]
pub struct Cli {
    /// Path to config file (checked in order: local config.toml, ~/.config/cil-router/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the router
    Start {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the status of a running router
    Status {
        /// Base URL of the router (defaults to the configured host and port)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Switch the active provider of a running router
    Select {
        /// Zero-based provider index
        index: usize,

        /// Base URL of the router (defaults to the configured host and port)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// List configured providers
    Providers,
}

/// File and environment layers without validation, for commands that only
/// talk to a running instance.
pub fn client_config(path: Option<PathBuf>) -> Config {
    let mut config = load_config_file(path).unwrap_or_default();
    if let Err(e) = config.apply_env() {
        tracing::warn!("Ignoring environment overrides: {}", e);
    }
    config
}

pub fn log_level(path: Option<PathBuf>) -> String {
    let level = client_config(path).logging.level;
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => level,
        _ => "info".to_string(),
    }
}

/// Base URL of a local instance. Wildcard bind addresses are dialled on loopback.
pub fn base_url(config: &Config, url: Option<String>) -> String {
    if let Some(url) = url {
        return url.trim_end_matches('/').to_string();
    }
    let host = match config.server.host.as_str() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    };
    format!("http://{}:{}", host, config.server.port)
}

/// Attach the configured auth key, if any.
pub fn authorize(builder: reqwest::RequestBuilder, config: &Config) -> reqwest::RequestBuilder {
    if config.auth.api_key.is_empty() {
        builder
    } else {
        builder.bearer_auth(&config.auth.api_key)
    }
}
