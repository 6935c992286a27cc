use std::path::PathBuf;

use cil_router_core::config::{load_config, mask_key};

pub fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("Configured providers ({}):", config.providers.len());
    for (index, provider) in config.providers.iter().enumerate() {
        let marker = if index == config.routing.active_provider { "*" } else { " " };
        println!("{} [{}] {} endpoint(s)", marker, index, provider.endpoints.len());
        for endpoint in &provider.endpoints {
            println!("      {}  key {}", endpoint.base_url, mask_key(&endpoint.api_key));
        }
    }

    Ok(())
}
