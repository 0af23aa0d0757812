use clap::Parser;
use std::sync::Arc;
use toolgate::config::Cli;
use toolgate::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let gateway = Arc::new(cli.build_gateway()?);
    server::run(gateway, cli.server_config()?).await
}
