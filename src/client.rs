//! Client driver for the catalog protocol.
//!
//! Every request is stamped with a tick of the client's own Lamport clock and
//! every text reply's timestamp is folded back in, so the client observes
//! the same causal order as the server.

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::clock::LamportClock;
use crate::constants::{
    Command, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_LINE_LEN, EOF_MARKER, ERROR_PREFIX, Framing,
};
use crate::protocol::{
    Request, Response, StreamFrame, decode_frame, parse_stream_header, parse_timestamp, take_line,
};
use crate::selector::WeightedRoundRobin;
use crate::{Error, Result};

pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
    clock: LamportClock,
    framing: Framing,
    max_chunk: usize,
}

impl Client {
    pub async fn connect(addr: &str, framing: Framing) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(%addr, "connected to catalog server");
        Ok(Client {
            stream,
            buf: BytesMut::with_capacity(DEFAULT_CHUNK_SIZE * 2),
            clock: LamportClock::new(),
            framing,
            max_chunk: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Connect to the server the selector places this client on.
    pub async fn connect_placed(selector: &WeightedRoundRobin, framing: Framing) -> Result<Self> {
        let endpoint = selector.next();
        debug!(endpoint = %endpoint, "placement decision");
        Self::connect(&endpoint.address(), framing).await
    }

    /// Accept stream chunks up to `max_chunk` bytes.
    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub async fn list_playlists(&mut self) -> Result<Vec<String>> {
        self.call(Command::ListPlaylists, &[]).await
    }

    pub async fn songs(&mut self, playlist: &str) -> Result<Vec<String>> {
        self.call(Command::GetSongs, &[playlist]).await
    }

    pub async fn lyrics(&mut self, playlist: &str, song: &str) -> Result<String> {
        let fields = self.call(Command::GetLyrics, &[playlist, song]).await?;
        Ok(fields.into_iter().next().unwrap_or_default())
    }

    /// The server's clock value as reported by `GET_LAMPORT`.
    pub async fn lamport(&mut self) -> Result<u64> {
        let fields = self.call(Command::GetLamport, &[]).await?;
        match fields.as_slice() {
            [value] => parse_timestamp(value),
            _ => Err(Error::Protocol(format!(
                "GET_LAMPORT returned {} field(s)",
                fields.len()
            ))),
        }
    }

    /// Fetch a whole song into memory.
    pub async fn play_song(&mut self, playlist: &str, song: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.stream_song(playlist, song, &mut data).await?;
        Ok(data)
    }

    /// Fetch a song into `dir/<song>` and return the path of the file.
    ///
    /// The song is written next to its final name first and renamed once
    /// the stream is complete, so a failed transfer never leaves a
    /// truncated file under the song's name.
    pub async fn download_song(&mut self, playlist: &str, song: &str, dir: &Path) -> Result<PathBuf> {
        let name = Path::new(song)
            .file_name()
            .ok_or_else(|| Error::NotFound(format!("song {song:?}")))?;
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(name);
        let mut partial = path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        let mut file = tokio::fs::File::create(&partial).await?;

        match self.stream_song(playlist, song, &mut file).await {
            Ok(bytes) => {
                file.flush().await?;
                drop(file);
                tokio::fs::rename(&partial, &path).await?;
                info!(path = %path.display(), bytes, "song downloaded");
                Ok(path)
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    /// Request a song and copy its bytes into `out`. Returns the byte count.
    pub async fn stream_song<W>(&mut self, playlist: &str, song: &str, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        self.send(Command::PlaySong, &[playlist, song]).await?;
        match self.framing {
            Framing::LengthPrefixed => self.read_framed_stream(out).await,
            Framing::Sentinel => self.read_sentinel_stream(out).await,
        }
    }

    async fn read_framed_stream<W>(&mut self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let line = self.read_line().await?;
        let Some(expected) = parse_stream_header(&line) else {
            self.reply_to_error(&line)?;
            return Err(Error::Protocol(format!("unexpected reply to PLAY_SONG: {line:?}")));
        };

        let mut received: u64 = 0;
        loop {
            match decode_frame(&mut self.buf, self.max_chunk)? {
                Some(StreamFrame::Chunk(chunk)) => {
                    out.write_all(&chunk).await?;
                    received += chunk.len() as u64;
                }
                Some(StreamFrame::End) => break,
                None => self.fill().await?,
            }
        }

        if received != expected {
            return Err(Error::Protocol(format!(
                "stream announced {expected} bytes but carried {received}"
            )));
        }
        Ok(received)
    }

    /// Sentinel streams end at the first read that leaves `EOF` at the end of
    /// the buffer.
    async fn read_sentinel_stream<W>(&mut self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.buf.starts_with(ERROR_PREFIX.as_bytes()) {
                if let Some(line) = take_line(&mut self.buf, DEFAULT_MAX_LINE_LEN)? {
                    self.reply_to_error(&line)?;
                    return Err(Error::Protocol(format!("unexpected reply: {line:?}")));
                }
            } else if self.buf.ends_with(EOF_MARKER) {
                let len = self.buf.len() - EOF_MARKER.len();
                let data = self.buf.split_to(len);
                self.buf.clear();
                out.write_all(&data).await?;
                return Ok(len as u64);
            }
            self.fill().await?;
        }
    }

    /// Observe a text reply and surface it as an error when it is one.
    fn reply_to_error(&mut self, line: &str) -> Result<()> {
        let response = Response::parse(line)?;
        self.clock.observe(response.timestamp);
        response.into_result().map(|_| ())
    }

    async fn call(&mut self, command: Command, args: &[&str]) -> Result<Vec<String>> {
        self.send(command, args).await?;
        let line = self.read_line().await?;
        let response = Response::parse(&line)?;
        self.clock.observe(response.timestamp);
        Ok(response.into_result()?.fields)
    }

    async fn send(&mut self, command: Command, args: &[&str]) -> Result<()> {
        let request = Request::new(
            command,
            args.iter().map(|a| a.to_string()).collect(),
            self.clock.tick(),
        );
        debug!(command = command.as_str(), timestamp = request.timestamp, "sending request");
        self.stream.write_all(request.encode().as_bytes()).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = take_line(&mut self.buf, DEFAULT_MAX_LINE_LEN)? {
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        Ok(())
    }
}
