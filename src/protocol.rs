//! Wire format of the catalog protocol.
//!
//! Requests and text responses are single lines of `|`-separated fields,
//! the last of which is a Lamport timestamp. Inside a field `\`, `|`, LF and
//! CR are escaped as `\\`, `\|`, `\n` and `\r`.
//!
//! Song streams are either length-prefixed (a `STREAM|<len>` header line,
//! u32-le framed chunks, then a zero-length frame followed by `EOF`) or, in
//! sentinel mode, raw chunks followed by `EOF`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    Command, EOF_MARKER, ERROR_PREFIX, ESCAPE, FIELD_SEPARATOR, MAX_TIMESTAMP, STREAM_HEADER,
};
use crate::{Error, Result};

/// Escape a single field so it contains no separator and no line break.
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Join fields into one line body (no trailing newline).
pub fn join_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(FIELD_SEPARATOR);
        }
        line.push_str(&escape_field(field.as_ref()));
    }
    line
}

/// Split a line body on unescaped separators and unescape every field.
pub fn split_fields(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some('\\') => current.push('\\'),
                Some('|') => current.push('|'),
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(other) => {
                    return Err(Error::Protocol(format!("unknown escape \\{other}")));
                }
                None => return Err(Error::Protocol("dangling escape".to_string())),
            },
            FIELD_SEPARATOR => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

/// Parse a wire timestamp.
pub fn parse_timestamp(field: &str) -> Result<u64> {
    let ts: u64 = field
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("timestamp is not an integer: {field:?}")))?;
    if ts > MAX_TIMESTAMP {
        return Err(Error::Protocol(format!("timestamp out of range: {ts}")));
    }
    Ok(ts)
}

/// Take one `\n`-terminated line off the front of `buf`.
///
/// Returns `Ok(None)` when no complete line is buffered yet. A trailing `\r`
/// is stripped. Fails with [`Error::FrameTooLarge`] when a line is longer
/// than `max_len` bytes, whether or not its newline has arrived yet.
pub fn take_line(buf: &mut BytesMut, max_len: usize) -> Result<Option<String>> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(pos) if pos > max_len => {
            buf.advance(pos + 1);
            Err(Error::FrameTooLarge {
                len: pos,
                max: max_len,
            })
        }
        Some(pos) => {
            let mut line = buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            Ok(Some(String::from_utf8(line.to_vec())?))
        }
        None if buf.len() > max_len => Err(Error::FrameTooLarge {
            len: buf.len(),
            max: max_len,
        }),
        None => Ok(None),
    }
}

/// A request as it arrives, before the command word is resolved.
///
/// The timestamp is available even when the command is unknown, so the
/// sender's clock can still be observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub command: String,
    pub args: Vec<String>,
    pub timestamp: u64,
}

impl RawRequest {
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = split_fields(line)?;
        if fields.len() < 2 {
            return Err(Error::Protocol(format!(
                "expected COMMAND|...|timestamp, got {} field(s)",
                fields.len()
            )));
        }
        let timestamp = parse_timestamp(&fields.pop().unwrap_or_default())?;
        let command = fields.remove(0);
        Ok(RawRequest {
            command,
            args: fields,
            timestamp,
        })
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub args: Vec<String>,
    pub timestamp: u64,
}

impl Request {
    pub fn new(command: Command, args: Vec<String>, timestamp: u64) -> Self {
        Request {
            command,
            args,
            timestamp,
        }
    }

    /// Encode as a newline-terminated request line.
    pub fn encode(&self) -> String {
        let ts = self.timestamp.to_string();
        let mut line = join_fields(
            std::iter::once(self.command.as_str())
                .chain(self.args.iter().map(String::as_str))
                .chain(std::iter::once(ts.as_str())),
        );
        line.push('\n');
        line
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = Error;

    fn try_from(raw: RawRequest) -> Result<Self> {
        let command = Command::parse(&raw.command)?;
        if raw.args.len() != command.arity() {
            return Err(Error::Protocol(format!(
                "{} takes {} argument(s), got {}",
                command.as_str(),
                command.arity(),
                raw.args.len()
            )));
        }
        Ok(Request {
            command,
            args: raw.args,
            timestamp: raw.timestamp,
        })
    }
}

/// A text response: payload fields followed by the server timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub fields: Vec<String>,
    pub timestamp: u64,
}

impl Response {
    pub fn new(fields: Vec<String>, timestamp: u64) -> Self {
        Response { fields, timestamp }
    }

    pub fn error(err: &Error, timestamp: u64) -> Self {
        Response {
            fields: vec![format!("{ERROR_PREFIX}{err}")],
            timestamp,
        }
    }

    pub fn is_error(&self) -> bool {
        self.fields.len() == 1 && self.fields[0].starts_with(ERROR_PREFIX)
    }

    /// Encode as a newline-terminated response line.
    pub fn encode(&self) -> String {
        let ts = self.timestamp.to_string();
        let mut line = join_fields(
            self.fields
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(ts.as_str())),
        );
        line.push('\n');
        line
    }

    pub fn parse(line: &str) -> Result<Self> {
        // A bare timestamp is an empty list; `|<ts>` is one empty field.
        let mut fields = split_fields(line)?;
        let timestamp = parse_timestamp(&fields.pop().unwrap_or_default())?;
        Ok(Response { fields, timestamp })
    }

    /// Turn an `ERROR:` reply into `Error::Remote`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_error() {
            let reason = self.fields[0][ERROR_PREFIX.len()..].to_string();
            return Err(Error::Remote(reason));
        }
        Ok(self)
    }
}

/// Header line announcing a length-prefixed stream of `len` bytes.
pub fn encode_stream_header(len: u64) -> String {
    format!("{STREAM_HEADER}{FIELD_SEPARATOR}{len}\n")
}

/// Parse a stream header line, returning the announced length.
pub fn parse_stream_header(line: &str) -> Option<u64> {
    let rest = line.strip_prefix(STREAM_HEADER)?.strip_prefix(FIELD_SEPARATOR)?;
    rest.parse().ok()
}

/// One frame of a length-prefixed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Chunk(Bytes),
    End,
}

/// Write a chunk frame. Empty chunks are reserved for the end marker and
/// must not be written with this function.
pub fn write_chunk_frame<B: BufMut>(buf: &mut B, data: &[u8]) {
    debug_assert!(!data.is_empty());
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Write the end-of-stream marker: a zero-length frame followed by `EOF`.
pub fn write_end_frame<B: BufMut>(buf: &mut B) {
    buf.put_u32_le(0);
    buf.put_slice(EOF_MARKER);
}

/// Decode the next frame from `buf`, or `Ok(None)` if it is incomplete.
pub fn decode_frame(buf: &mut BytesMut, max_chunk: usize) -> Result<Option<StreamFrame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if len == 0 {
        if buf.len() < 4 + EOF_MARKER.len() {
            return Ok(None);
        }
        if &buf[4..4 + EOF_MARKER.len()] != EOF_MARKER {
            return Err(Error::Protocol("zero-length frame without EOF".to_string()));
        }
        buf.advance(4 + EOF_MARKER.len());
        return Ok(Some(StreamFrame::End));
    }

    if len > max_chunk {
        return Err(Error::FrameTooLarge {
            len,
            max: max_chunk,
        });
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(StreamFrame::Chunk(buf.split_to(len).freeze())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(escape_field("a|b"), "a\\|b");
        assert_eq!(escape_field("line1\nline2"), "line1\\nline2");
        assert_eq!(escape_field("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_split_respects_escapes() {
        let fields = split_fields("a\\|b|c\\nd|e").unwrap();
        assert_eq!(fields, vec!["a|b", "c\nd", "e"]);
    }

    #[test]
    fn test_split_rejects_bad_escape() {
        assert!(matches!(split_fields("a\\x"), Err(Error::Protocol(_))));
        assert!(matches!(split_fields("a\\"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_raw_request() {
        let raw = RawRequest::parse("GET_LYRICS|rock|a.mp3|17").unwrap();
        assert_eq!(raw.command, "GET_LYRICS");
        assert_eq!(raw.args, vec!["rock", "a.mp3"]);
        assert_eq!(raw.timestamp, 17);
    }

    #[test]
    fn test_parse_request_without_timestamp() {
        assert!(matches!(
            RawRequest::parse("LIST_PLAYLISTS"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            RawRequest::parse("LIST_PLAYLISTS|soon"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            RawRequest::parse("LIST_PLAYLISTS|-3"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_timestamp_range() {
        assert_eq!(parse_timestamp("9223372036854775807").unwrap(), MAX_TIMESTAMP);
        assert!(parse_timestamp("9223372036854775808").is_err());
    }

    #[test]
    fn test_request_arity() {
        let raw = RawRequest::parse("GET_SONGS|5").unwrap();
        assert!(matches!(Request::try_from(raw), Err(Error::Protocol(_))));

        let raw = RawRequest::parse("SHUFFLE|5").unwrap();
        assert!(matches!(
            Request::try_from(raw),
            Err(Error::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_request_encode() {
        let req = Request::new(
            Command::PlaySong,
            vec!["rock".into(), "a|b.mp3".into()],
            4,
        );
        assert_eq!(req.encode(), "PLAY_SONG|rock|a\\|b.mp3|4\n");
    }

    #[test]
    fn test_response_encode_and_parse() {
        let resp = Response::new(vec!["rock".into(), "jazz".into()], 9);
        assert_eq!(resp.encode(), "rock|jazz|9\n");

        let parsed = Response::parse("rock|jazz|9").unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_empty_list_response() {
        let resp = Response::new(vec![], 3);
        assert_eq!(resp.encode(), "3\n");
        assert!(Response::parse("3").unwrap().fields.is_empty());
        assert_eq!(Response::parse("|3").unwrap().fields, vec![""]);
    }

    #[test]
    fn test_error_response() {
        let resp = Response::error(&Error::NotFound("playlist x".into()), 2);
        assert_eq!(resp.encode(), "ERROR: Not found: playlist x|2\n");
        let parsed = Response::parse("ERROR: Not found: playlist x|2").unwrap();
        match parsed.into_result() {
            Err(Error::Remote(reason)) => assert_eq!(reason, "Not found: playlist x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_take_line() {
        let mut buf = BytesMut::from(&b"GET_LAMPORT|1\r\nLIST"[..]);
        assert_eq!(take_line(&mut buf, 1024).unwrap().unwrap(), "GET_LAMPORT|1");
        assert_eq!(take_line(&mut buf, 1024).unwrap(), None);
        assert_eq!(&buf[..], b"LIST");
    }

    #[test]
    fn test_take_line_too_long() {
        let mut buf = BytesMut::from(&[b'a'; 32][..]);
        assert!(matches!(
            take_line(&mut buf, 16),
            Err(Error::FrameTooLarge { len: 32, max: 16 })
        ));
    }

    #[test]
    fn test_take_line_too_long_with_newline() {
        let mut long = vec![b'a'; 32];
        long.extend_from_slice(b"\nGET_LAMPORT|1\n");
        let mut buf = BytesMut::from(&long[..]);
        assert!(matches!(
            take_line(&mut buf, 16),
            Err(Error::FrameTooLarge { len: 32, max: 16 })
        ));
        // The offending line is consumed; the next one is intact.
        assert_eq!(take_line(&mut buf, 16).unwrap().unwrap(), "GET_LAMPORT|1");
    }

    #[test]
    fn test_take_line_at_limit() {
        let mut buf = BytesMut::from(&b"0123456789abcdef\n"[..]);
        assert_eq!(take_line(&mut buf, 16).unwrap().unwrap(), "0123456789abcdef");
    }

    #[test]
    fn test_stream_header() {
        assert_eq!(encode_stream_header(12), "STREAM|12\n");
        assert_eq!(parse_stream_header("STREAM|12"), Some(12));
        assert_eq!(parse_stream_header("ERROR: nope|3"), None);
    }

    #[test]
    fn test_frames_carry_eof_bytes_safely() {
        let mut buf = BytesMut::new();
        write_chunk_frame(&mut buf, b"xxEOF");
        write_end_frame(&mut buf);

        assert_eq!(
            decode_frame(&mut buf, 16).unwrap(),
            Some(StreamFrame::Chunk(Bytes::from_static(b"xxEOF")))
        );
        assert_eq!(decode_frame(&mut buf, 16).unwrap(), Some(StreamFrame::End));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut buf = BytesMut::new();
        write_chunk_frame(&mut buf, b"hello");
        let mut partial = buf.split_to(6);
        assert_eq!(decode_frame(&mut partial, 16).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame() {
        let mut buf = BytesMut::new();
        write_chunk_frame(&mut buf, &[0u8; 32]);
        assert!(matches!(
            decode_frame(&mut buf, 16),
            Err(Error::FrameTooLarge { len: 32, max: 16 })
        ));
    }
}
