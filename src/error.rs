//! Error types for the jukebox-rs library.

use std::io;
use std::string::FromUtf8Error;

/// Result type alias for jukebox-rs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while serving or consuming the catalog protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("INVALID_COMMAND: {0}")]
    InvalidCommand(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An `ERROR:` reply received from the server.
    #[error("Server error: {0}")]
    Remote(String),

    #[error("Frame too large: {len} bytes, limit is {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error must terminate the session that hit it.
    ///
    /// Everything else is reported back to the peer as an `ERROR:` line and
    /// the session keeps reading requests.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout(_) | Error::FrameTooLarge { .. }
        )
    }
}
