use clap::Parser;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging. Config is read again by each command once the
    // subscriber is up, so load warnings from here are not lost.
    let level = cli::log_level(cli.config.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cil_router=info".parse()?)
                .add_directive(format!("cil_router_core={}", level).parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    match cli.command {
        Commands::Start { port } => {
            cli::commands::start::run(cli.config, port).await?;
        }
        Commands::Status { url } => {
            cli::commands::status::run(cli.config, url).await?;
        }
        Commands::Select { index, url } => {
            cli::commands::select::run(cli.config, index, url).await?;
        }
        Commands::Providers => {
            cli::commands::providers::run(cli.config)?;
        }
    }

    Ok(())
}
