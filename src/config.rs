//! Configuration for the server, client and balancer binaries.
//!
//! Each config is read from an optional TOML file; a missing file means
//! defaults. A few `JUKEBOX_*` environment variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::acceptor::AcceptorOptions;
use crate::constants::{
    ClockScope, DEFAULT_BALANCER_PORT, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_LINE_LEN,
    DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT, Framing,
};
use crate::selector::{Endpoint, WeightedRoundRobin};
use crate::session::SessionOptions;
use crate::{Error, Result};

fn load_or_default<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    } else {
        Ok(T::default())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,

    /// Directory holding one sub-directory per playlist
    pub catalog_root: PathBuf,

    /// Size of the chunks songs are streamed in
    pub chunk_size: usize,

    pub framing: Framing,

    /// Whether sessions share one Lamport clock or get one each
    pub clock_scope: ClockScope,

    /// Maximum number of concurrently served connections
    pub max_sessions: usize,

    /// Seconds a session may sit idle between requests (0 disables)
    pub idle_timeout_secs: u64,

    /// Seconds a single reply write may block (0 disables)
    pub write_timeout_secs: u64,

    pub max_line_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("{DEFAULT_SERVER_HOST}:{DEFAULT_SERVER_PORT}"),
            catalog_root: PathBuf::from("playlists"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            framing: Framing::default(),
            clock_scope: ClockScope::default(),
            max_sessions: 1024,
            idle_timeout_secs: 300,
            write_timeout_secs: 30,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl ServerConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_or_default(path)
    }

    /// Apply `JUKEBOX_BIND` and `JUKEBOX_CATALOG`.
    pub fn apply_env(&mut self) {
        if let Some(bind) = env_var("JUKEBOX_BIND") {
            self.bind = bind;
        }
        if let Some(root) = env_var("JUKEBOX_CATALOG") {
            self.catalog_root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(Error::Configuration(format!(
                "chunk_size must be between 1 and {}, got {}",
                u32::MAX,
                self.chunk_size
            )));
        }
        if self.max_sessions == 0 {
            return Err(Error::Configuration("max_sessions must be positive".to_string()));
        }
        if self.max_line_len == 0 {
            return Err(Error::Configuration("max_line_len must be positive".to_string()));
        }
        Ok(())
    }

    pub fn acceptor_options(&self) -> AcceptorOptions {
        AcceptorOptions {
            max_sessions: self.max_sessions,
            clock_scope: self.clock_scope,
            session: SessionOptions {
                chunk_size: self.chunk_size,
                framing: self.framing,
                idle_timeout: secs(self.idle_timeout_secs),
                write_timeout: secs(self.write_timeout_secs),
                max_line_len: self.max_line_len,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to when no backends are configured
    pub server: String,

    /// Where downloaded songs are stored
    pub download_dir: PathBuf,

    pub framing: Framing,

    /// Largest stream chunk accepted from the server
    pub max_chunk: usize,

    /// Candidate servers; when present the client places itself with the
    /// weighted round-robin selector
    pub backends: Vec<Endpoint>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("{DEFAULT_SERVER_HOST}:{DEFAULT_SERVER_PORT}"),
            download_dir: PathBuf::from("downloads"),
            framing: Framing::default(),
            max_chunk: DEFAULT_CHUNK_SIZE,
            backends: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_or_default(path)
    }

    /// Apply `JUKEBOX_SERVER`.
    pub fn apply_env(&mut self) {
        if let Some(server) = env_var("JUKEBOX_SERVER") {
            self.server = server;
        }
    }

    /// A selector over the configured backends, if there are any.
    pub fn selector(&self) -> Result<Option<WeightedRoundRobin>> {
        if self.backends.is_empty() {
            return Ok(None);
        }
        WeightedRoundRobin::new(self.backends.clone()).map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Address clients connect to
    pub bind: String,

    /// Catalog servers clients are spread over
    pub backends: Vec<Endpoint>,

    pub connect_timeout_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            bind: format!("{DEFAULT_SERVER_HOST}:{DEFAULT_BALANCER_PORT}"),
            backends: Vec::new(),
            connect_timeout_secs: 5,
        }
    }
}

impl BalancerConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_or_default(path)
    }

    /// Apply `JUKEBOX_BIND`.
    pub fn apply_env(&mut self) {
        if let Some(bind) = env_var("JUKEBOX_BIND") {
            self.bind = bind;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Build the selector; an empty or invalid backend list is an error.
    pub fn selector(&self) -> Result<WeightedRoundRobin> {
        WeightedRoundRobin::new(self.backends.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = ServerConfig::load_or_default("/nonexistent/jukebox.toml").unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.clock_scope, ClockScope::Instance);
    }

    #[test]
    fn test_partial_server_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            "bind = \"0.0.0.0:9000\"\nframing = \"sentinel\"\nclock_scope = \"connection\"\nidle_timeout_secs = 0\n",
        )
        .unwrap();

        let config = ServerConfig::load_or_default(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.framing, Framing::Sentinel);

        let options = config.acceptor_options();
        assert_eq!(options.clock_scope, ClockScope::Connection);
        assert_eq!(options.session.idle_timeout, None);
        assert_eq!(options.session.write_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "chunk_size = \"big\"").unwrap();
        assert!(matches!(
            ServerConfig::load_or_default(&path),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_validate_chunk_size() {
        let config = ServerConfig {
            chunk_size: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_balancer_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balancer.toml");
        std::fs::write(
            &path,
            r#"
bind = "127.0.0.1:8000"

[[backends]]
host = "127.0.0.1"
port = 8081
weight = 3

[[backends]]
host = "127.0.0.1"
port = 8082
weight = 2
"#,
        )
        .unwrap();

        let config = BalancerConfig::load_or_default(&path).unwrap();
        let selector = config.selector().unwrap();
        assert_eq!(selector.cycle_len(), 5);
        assert_eq!(selector.next().port, 8081);
    }

    #[test]
    fn test_balancer_without_backends_is_configuration_error() {
        assert!(matches!(
            BalancerConfig::default().selector(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_negative_weight_rejected_at_parse() {
        let parsed: std::result::Result<BalancerConfig, _> = toml::from_str(
            "[[backends]]\nhost = \"h\"\nport = 1\nweight = -1\n",
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_client_selector_optional() {
        assert!(ClientConfig::default().selector().unwrap().is_none());
        let config = ClientConfig {
            backends: vec![Endpoint::new("127.0.0.1", 1, 1)],
            ..ClientConfig::default()
        };
        assert!(config.selector().unwrap().is_some());
    }
}
