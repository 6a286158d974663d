//! jukebox-client: one-shot commands against a catalog server.
//!
//! Downloaded songs are saved under the download directory; playing them is
//! left to whatever player the path is handed to.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jukebox_rs::config::ClientConfig;
use jukebox_rs::{Client, logging};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path of the TOML config file
    #[arg(short, long, default_value = "jukebox-client.toml")]
    config: PathBuf,

    /// Server address, overrides the config file and any backend list
    #[arg(short, long)]
    server: Option<String>,

    /// Directory downloaded songs are written to
    #[arg(short, long)]
    download_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the playlists
    Playlists,
    /// List the songs of a playlist
    Songs { playlist: String },
    /// Print the lyrics of a song
    Lyrics { playlist: String, song: String },
    /// Download a song and print where it was saved
    Play { playlist: String, song: String },
    /// Print the server's Lamport clock
    Lamport,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let args = Args::parse();
    let mut config = ClientConfig::load_or_default(&args.config)?;
    config.apply_env();
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }

    let client = match (args.server, config.selector()?) {
        (Some(server), _) => Client::connect(&server, config.framing).await?,
        (None, Some(selector)) => Client::connect_placed(&selector, config.framing).await?,
        (None, None) => Client::connect(&config.server, config.framing).await?,
    };
    let mut client = client.with_max_chunk(config.max_chunk);

    match args.command {
        Cmd::Playlists => {
            for (i, name) in client.list_playlists().await?.iter().enumerate() {
                println!("{}. {}", i + 1, name);
            }
        }
        Cmd::Songs { playlist } => {
            for (i, name) in client.songs(&playlist).await?.iter().enumerate() {
                println!("{}. {}", i + 1, name);
            }
        }
        Cmd::Lyrics { playlist, song } => {
            println!("{}", client.lyrics(&playlist, &song).await?);
        }
        Cmd::Play { playlist, song } => {
            let path = client
                .download_song(&playlist, &song, &config.download_dir)
                .await?;
            println!("{}", path.display());
        }
        Cmd::Lamport => {
            println!("{}", client.lamport().await?);
        }
    }

    info!(clock = client.clock().read(), "done");
    Ok(())
}
