//! jukebox-server: serves playlists, lyrics and songs from a catalog directory.
//!
//! Every connection gets its own session task; all sessions share the
//! instance's Lamport clock unless `clock_scope = "connection"` is set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use jukebox_rs::config::ServerConfig;
use jukebox_rs::{Acceptor, FsCatalog, logging};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path of the TOML config file
    #[arg(short, long, default_value = "jukebox-server.toml")]
    config: PathBuf,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Catalog root directory, overrides the config file
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let args = Args::parse();
    let mut config = ServerConfig::load_or_default(&args.config)?;
    config.apply_env();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(catalog) = args.catalog {
        config.catalog_root = catalog;
    }
    config.validate()?;

    info!(
        catalog = %config.catalog_root.display(),
        framing = ?config.framing,
        clock_scope = ?config.clock_scope,
        max_sessions = config.max_sessions,
        "starting jukebox-server"
    );

    let catalog = Arc::new(FsCatalog::new(&config.catalog_root));
    let acceptor = Acceptor::bind(&config.bind, catalog, config.acceptor_options()).await?;

    acceptor
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        })
        .await?;

    Ok(())
}
