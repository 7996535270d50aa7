use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_server::{
    cli::{Cli, Command, ServeArgs},
    client,
    config::ServerConfig,
    server::Server,
    services::{Directory, Services, TracingSink},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let listen = args.listen.unwrap_or(config.listen);

    let directory = Arc::new(Directory::from_config(&config));
    let services = Services::new(directory.clone(), directory, Arc::new(TracingSink));
    let server = Server::bind(listen, services, config.settings()).await?;
    let addr = server.local_addr().context("failed to read bound address")?;
    info!("server listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err.into());
    }
    Ok(())
}
