//! Protocol constants and enumerations.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default address the catalog server listens on.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default address the placement balancer listens on.
pub const DEFAULT_BALANCER_PORT: u16 = 8000;

/// Separator between fields of a request or text response.
pub const FIELD_SEPARATOR: char = '|';

/// Escape character used inside fields.
pub const ESCAPE: char = '\\';

/// Literal end-of-stream marker closing a `PLAY_SONG` stream.
pub const EOF_MARKER: &[u8] = b"EOF";

/// Prefix of every error reply.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Leading field of the header line of a length-prefixed stream.
pub const STREAM_HEADER: &str = "STREAM";

/// Size of the chunks a song is streamed in.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Longest request line a session accepts.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Largest timestamp accepted on the wire (2^63 - 1).
pub const MAX_TIMESTAMP: u64 = i64::MAX as u64;

/// Extension substituted for the media extension when looking up lyrics.
pub const LYRICS_EXTENSION: &str = "txt";

/// Commands understood by the catalog server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ListPlaylists,
    GetSongs,
    GetLyrics,
    PlaySong,
    GetLamport,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::ListPlaylists => "LIST_PLAYLISTS",
            Command::GetSongs => "GET_SONGS",
            Command::GetLyrics => "GET_LYRICS",
            Command::PlaySong => "PLAY_SONG",
            Command::GetLamport => "GET_LAMPORT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "LIST_PLAYLISTS" => Ok(Command::ListPlaylists),
            "GET_SONGS" => Ok(Command::GetSongs),
            "GET_LYRICS" => Ok(Command::GetLyrics),
            "PLAY_SONG" => Ok(Command::PlaySong),
            "GET_LAMPORT" => Ok(Command::GetLamport),
            _ => Err(Error::InvalidCommand(s.to_string())),
        }
    }

    /// Number of arguments between the command word and the timestamp.
    pub fn arity(&self) -> usize {
        match self {
            Command::ListPlaylists | Command::GetLamport => 0,
            Command::GetSongs => 1,
            Command::GetLyrics | Command::PlaySong => 2,
        }
    }
}

/// How a `PLAY_SONG` stream is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// `STREAM|<len>` header, u32-le length-prefixed chunks, then a
    /// zero-length frame followed by `EOF`.
    #[default]
    LengthPrefixed,
    /// Raw chunks followed by `EOF`. Not binary-safe: payloads ending in
    /// `EOF` are truncated by the reader.
    Sentinel,
}

/// Which sessions share a Lamport clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockScope {
    /// One clock for every session of a server instance.
    #[default]
    Instance,
    /// A fresh clock per accepted connection.
    Connection,
}
