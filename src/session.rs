//! Per-connection protocol state machine.
//!
//! A session reads one request line at a time, folds the sender's timestamp
//! into the Lamport clock, dispatches to the catalog and writes either a text
//! reply stamped with a fresh clock value or a song stream.
//!
//! Request-level failures (bad shape, unknown command, missing entry) are
//! answered with `ERROR: <reason>` and the session keeps going. Transport
//! failures and deadline expiry end this session only.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::catalog::{CatalogStore, Resource};
use crate::clock::LamportClock;
use crate::constants::{
    Command, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_LINE_LEN, EOF_MARKER, Framing,
};
use crate::protocol::{
    RawRequest, Request, Response, encode_stream_header, take_line, write_chunk_frame,
    write_end_frame,
};
use crate::{Error, Result};

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub chunk_size: usize,
    pub framing: Framing,
    /// Longest a session waits for the next request.
    pub idle_timeout: Option<Duration>,
    /// Longest a single reply write may block.
    pub write_timeout: Option<Duration>,
    pub max_line_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            framing: Framing::default(),
            idle_timeout: Some(Duration::from_secs(300)),
            write_timeout: Some(Duration::from_secs(30)),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Where a session is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Parsing,
    Dispatching,
    Responding,
    Streaming,
    Closed,
}

enum Reply {
    Fields(Vec<String>),
    Stream(Resource),
}

pub struct Session<T> {
    id: u64,
    stream: T,
    clock: Arc<LamportClock>,
    catalog: Arc<dyn CatalogStore>,
    options: SessionOptions,
    read_buf: BytesMut,
    state: SessionState,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: u64,
        stream: T,
        clock: Arc<LamportClock>,
        catalog: Arc<dyn CatalogStore>,
        options: SessionOptions,
    ) -> Self {
        Self {
            id,
            stream,
            clock,
            catalog,
            options,
            read_buf: BytesMut::with_capacity(4096),
            state: SessionState::AwaitingRequest,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve requests until the peer disconnects or a fatal error occurs.
    ///
    /// A clean disconnect returns `Ok(())`.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.close().await;
        result
    }

    async fn close(&mut self) {
        self.transition(SessionState::Closed);
        let _ = self.stream.shutdown().await;
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            self.transition(SessionState::AwaitingRequest);

            let line = match self.read_request_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(session = self.id, "peer closed connection");
                    return Ok(());
                }
                Err(e @ Error::FrameTooLarge { .. }) => {
                    // Best effort: the buffered garbage cannot be resynced.
                    let _ = self.respond_error(&e).await;
                    return Err(e);
                }
                Err(e) if !e.is_session_fatal() => {
                    self.respond_error(&e).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.transition(SessionState::Parsing);
            match self.dispatch(&line).await {
                Ok(Reply::Fields(fields)) => self.respond(fields).await?,
                Ok(Reply::Stream(resource)) => self.stream_resource(resource).await?,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => {
                    debug!(session = self.id, error = %e, "request failed");
                    self.respond_error(&e).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<Reply> {
        let raw = RawRequest::parse(line)?;
        self.clock.observe(raw.timestamp);
        let request = Request::try_from(raw)?;

        self.transition(SessionState::Dispatching);
        trace!(session = self.id, command = request.command.as_str(), args = ?request.args);

        let args = &request.args;
        let reply = match request.command {
            Command::ListPlaylists => {
                Reply::Fields(self.catalog.list_collections().await.map_err(downgrade)?)
            }
            Command::GetSongs => {
                Reply::Fields(self.catalog.list_items(&args[0]).await.map_err(downgrade)?)
            }
            Command::GetLyrics => {
                let lyrics = self
                    .catalog
                    .lyrics_for(&args[0], &args[1])
                    .await
                    .map_err(downgrade)?;
                Reply::Fields(vec![lyrics])
            }
            Command::PlaySong => Reply::Stream(
                self.catalog
                    .open_resource(&args[0], &args[1])
                    .await
                    .map_err(downgrade)?,
            ),
            Command::GetLamport => Reply::Fields(vec![self.clock.read().to_string()]),
        };
        Ok(reply)
    }

    async fn respond(&mut self, fields: Vec<String>) -> Result<()> {
        self.transition(SessionState::Responding);
        let response = Response::new(fields, self.clock.tick());
        self.write_all(response.encode().as_bytes()).await
    }

    async fn respond_error(&mut self, err: &Error) -> Result<()> {
        self.transition(SessionState::Responding);
        let response = Response::error(err, self.clock.tick());
        self.write_all(response.encode().as_bytes()).await
    }

    async fn stream_resource(&mut self, resource: Resource) -> Result<()> {
        self.transition(SessionState::Streaming);

        let Resource { len, reader } = resource;
        let framing = self.options.framing;
        if framing == Framing::LengthPrefixed {
            self.write_all(encode_stream_header(len).as_bytes()).await?;
        }

        let mut chunk = vec![0u8; self.options.chunk_size.max(1)];
        let mut frame = BytesMut::with_capacity(chunk.len() + 4);
        let mut sent: u64 = 0;
        let mut reader = reader.take(len);

        loop {
            // A failing catalog read cuts the song short but not the session.
            let n = match read_full(&mut reader, &mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(session = self.id, sent, error = %e, "catalog read failed mid-stream");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            match framing {
                Framing::LengthPrefixed => {
                    frame.clear();
                    write_chunk_frame(&mut frame, &chunk[..n]);
                    self.write_all(&frame).await?;
                }
                Framing::Sentinel => self.write_all(&chunk[..n]).await?,
            }
            sent += n as u64;
        }

        match framing {
            Framing::LengthPrefixed => {
                frame.clear();
                write_end_frame(&mut frame);
                self.write_all(&frame).await?;
            }
            Framing::Sentinel => self.write_all(EOF_MARKER).await?,
        }

        if sent != len {
            // The header already promised `len` bytes; the client will reject it.
            warn!(session = self.id, announced = len, sent, "song shrank while streaming");
        }
        let ts = self.clock.tick();
        debug!(session = self.id, bytes = sent, clock = ts, "stream complete");
        Ok(())
    }

    async fn read_request_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = take_line(&mut self.read_buf, self.options.max_line_len)? {
                return Ok(Some(line));
            }

            let idle = self.options.idle_timeout;
            let read = self.stream.read_buf(&mut self.read_buf);
            let n = match idle {
                Some(limit) => timeout(limit, read)
                    .await
                    .map_err(|_| Error::Timeout("waiting for a request"))??,
                None => read.await?,
            };

            if n == 0 {
                if !self.read_buf.is_empty() {
                    debug!(
                        session = self.id,
                        bytes = self.read_buf.len(),
                        "dropping unterminated request at disconnect"
                    );
                }
                return Ok(None);
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let limit = self.options.write_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match limit {
            Some(limit) => timeout(limit, write)
                .await
                .map_err(|_| Error::Timeout("writing a reply"))??,
            None => write.await?,
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            trace!(session = self.id, from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }
}

/// Catalog failures are reported to the peer instead of closing the session.
fn downgrade(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::NotFound(e.to_string()),
        other => other,
    }
}

/// Read until `buf` is full or the reader is exhausted.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
