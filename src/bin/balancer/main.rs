//! jukebox-balancer: spreads clients over catalog servers by weight.
//!
//! Each accepted client is placed on the next backend picked by the weighted
//! round-robin selector and proxied to it for the life of the connection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use jukebox_rs::config::BalancerConfig;
use jukebox_rs::logging;
use jukebox_rs::Endpoint;
use jukebox_rs::balancer::Balancer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path of the TOML config file
    #[arg(short, long, default_value = "jukebox-balancer.toml")]
    config: PathBuf,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Backend as host:port[:weight]; replaces the configured list when given
    #[arg(long = "backend")]
    backends: Vec<Endpoint>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let args = Args::parse();
    let mut config = BalancerConfig::load_or_default(&args.config)?;
    config.apply_env();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if !args.backends.is_empty() {
        config.backends = args.backends;
    }

    let selector = config.selector().context("invalid backend configuration")?;
    for endpoint in selector.endpoints() {
        info!(backend = %endpoint, "backend registered");
    }

    let balancer = Balancer::bind(&config.bind, selector, config.connect_timeout()).await?;
    balancer
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        })
        .await?;

    Ok(())
}
