mod acceptor;
mod admin;
mod app;
mod catalog;
mod config;
mod pool;
mod selector;
mod state;
mod tunnel;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let cli = config::Cli::parse();
    app::run(cli).await
}
