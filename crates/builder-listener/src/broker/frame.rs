// STOMP 1.2 frames and the codec that turns a byte stream into frames.
//
//   COMMAND EOL
//   header:value EOL   (repeated)
//   EOL
//   body NUL
//
// Bare EOLs between frames are heart-beats and are skipped by the decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from the broker.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error on broker stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown STOMP command '{0}'")]
    UnknownCommand(String),

    #[error("Malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header '{0}'")]
    InvalidEscape(String),

    #[error("Invalid content-length '{0}'")]
    InvalidContentLength(String),

    #[error("Frame body is not terminated by NUL")]
    MissingNul,

    #[error("Frame exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Frame header is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Ack => "ACK",
            StompCommand::Nack => "NACK",
            StompCommand::Disconnect => "DISCONNECT",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent verbatim, without escaping.
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

impl FromStr for StompCommand {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" | "STOMP" => StompCommand::Connect,
            "CONNECTED" => StompCommand::Connected,
            "SEND" => StompCommand::Send,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            "ACK" => StompCommand::Ack,
            "NACK" => StompCommand::Nack,
            "DISCONNECT" => StompCommand::Disconnect,
            "MESSAGE" => StompCommand::Message,
            "RECEIPT" => StompCommand::Receipt,
            "ERROR" => StompCommand::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    /// Headers in wire order. Repeated keys are allowed; the first one wins on lookup.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.get_header("destination")
    }

    pub fn body_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

// ---------------------------------------------------------------------------
// Header escaping
// ---------------------------------------------------------------------------

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// `tokio_util` codec for STOMP frames.
#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_len: usize,
}

impl Default for StompCodec {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl StompCodec {
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                limit: self.max_frame_len,
            });
        }
        Ok(())
    }
}

/// Offset of the blank line ending the headers, and where the body starts.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while let Some(pos) = buf[i..].iter().position(|b| *b == b'\n') {
        let nl = i + pos;
        let next = nl + 1;
        if buf.get(next) == Some(&b'\n') {
            return Some((nl, next + 1));
        }
        if buf.get(next) == Some(&b'\r') && buf.get(next + 1) == Some(&b'\n') {
            return Some((nl, next + 2));
        }
        i = next;
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(StompCommand, Vec<(String, String)>), FrameError> {
    let text = std::str::from_utf8(head).map_err(|_| FrameError::NotUtf8)?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command: StompCommand = lines.next().unwrap_or_default().parse()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }
    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = StompFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StompFrame>, FrameError> {
        // Heart-beats.
        loop {
            if src.starts_with(b"\r\n") {
                src.advance(2);
            } else if src.first() == Some(&b'\n') {
                src.advance(1);
            } else {
                break;
            }
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some((head_end, body_start)) = find_header_end(src) else {
            self.check_len(src.len())?;
            return Ok(None);
        };

        let (command, headers) = parse_head(&src[..head_end])?;

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                // `len` comes off the wire; bound it before any arithmetic.
                self.check_len(len)?;
                let body_end = body_start + len;
                self.check_len(body_end)?;
                if src.len() <= body_end {
                    src.reserve(body_end + 1 - src.len());
                    return Ok(None);
                }
                if src[body_end] != 0 {
                    return Err(FrameError::MissingNul);
                }
                body_end
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(pos) => body_start + pos,
                None => {
                    self.check_len(src.len())?;
                    return Ok(None);
                }
            },
        };

        let mut frame_bytes = src.split_to(body_end + 1);
        let body = frame_bytes.split_off(body_start);
        let body = body.freeze().slice(..body_end - body_start);

        Ok(Some(StompFrame {
            command,
            headers,
            body,
        }))
    }
}

impl Encoder<StompFrame> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: StompFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let escape = frame.command.escapes_headers();
        let mut head = String::new();
        head.push_str(frame.command.as_str());
        head.push('\n');
        for (key, value) in &frame.headers {
            if escape {
                head.push_str(&escape_header(key));
                head.push(':');
                head.push_str(&escape_header(value));
            } else {
                head.push_str(key);
                head.push(':');
                head.push_str(value);
            }
            head.push('\n');
        }
        if !frame.body.is_empty() && frame.get_header("content-length").is_none() {
            head.push_str(&format!("content-length:{}\n", frame.body.len()));
        }
        head.push('\n');

        self.check_len(head.len() + frame.body.len() + 1)?;
        dst.reserve(head.len() + frame.body.len() + 1);
        dst.put_slice(head.as_bytes());
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
