use std::path::PathBuf;

use serde_json::Value;

use crate::cli::{authorize, base_url, client_config};

pub async fn run(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<()> {
    let config = client_config(config_path);
    let base = base_url(&config, url);

    let request = authorize(reqwest::Client::new().get(format!("{}/", base)), &config);
    let response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            println!("Router at {}: NOT RUNNING ({})", base, e);
            return Ok(());
        }
    };

    if !response.status().is_success() {
        anyhow::bail!("Router at {} answered {}", base, response.status());
    }

    let status: Value = response.json().await?;

    println!("{} {}", status["name"].as_str().unwrap_or("CIL Router"), status["version"].as_str().unwrap_or("?"));
    println!("========================");
    println!("  URL: {}", base);
    println!("  Started at: {}", status["started_at"].as_str().unwrap_or("?"));
    println!();
    println!("Providers:");
    println!("  Active: {} of {}", status["active_provider"], status["provider_count"]);
    if let Some(providers) = status["providers"].as_array() {
        for provider in providers {
            let marker = if provider["index"] == status["active_provider"] { "*" } else { " " };
            println!("  {} [{}] {} endpoint(s)", marker, provider["index"], provider["endpoint_count"]);
            for endpoint in provider["endpoints"].as_array().into_iter().flatten() {
                println!("        {}", endpoint.as_str().unwrap_or("?"));
            }
        }
    }
    println!();

    let rate_limit = &status["rate_limit"];
    if rate_limit["enabled"].as_bool().unwrap_or(false) {
        println!("Rate limit:");
        println!("  {} req/min, burst {}", rate_limit["requests_per_minute"], rate_limit["burst_size"]);
        println!("  Trust proxy headers: {}", rate_limit["trust_proxy"]);
        println!("  Active buckets: {}", rate_limit["active_buckets"]);
    } else {
        println!("Rate limit: disabled");
    }

    Ok(())
}
