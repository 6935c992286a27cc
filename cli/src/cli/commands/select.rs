use std::path::PathBuf;

use serde_json::Value;

use crate::cli::{authorize, base_url, client_config};

pub async fn run(config_path: Option<PathBuf>, index: usize, url: Option<String>) -> anyhow::Result<()> {
    let config = client_config(config_path);
    let base = base_url(&config, url);

    let request = reqwest::Client::new()
        .post(format!("{}/select", base))
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(index.to_string());

    let response = authorize(request, &config)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Router at {} is not reachable: {}", base, e))?;

    let status = response.status();
    let body: Value = response.json().await?;
    let message = body["message"]
        .as_str()
        .or_else(|| body["error"]["message"].as_str())
        .unwrap_or("no message");

    if !status.is_success() || !body["success"].as_bool().unwrap_or(false) {
        anyhow::bail!("Switch failed ({}): {}", status, message);
    }

    println!("✓ {} ({} of {})", message, body["current"], body["total"]);
    Ok(())
}
