//! STOMP 1.2 frame codec
//!
//! A frame is `COMMAND EOL *(header EOL) EOL body NUL`. Bare EOLs between
//! frames are heart-beats. Header values are escaped on every command except
//! CONNECT and CONNECTED.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Headers whose values never appear in logs
const SENSITIVE_HEADERS: [&str; 2] = ["authorization", "passcode"];

/// Frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header")]
    InvalidEscape,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("body not terminated by NUL")]
    MissingNul,

    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// STOMP commands this client sends or understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Send,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

/// A single STOMP frame
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of header `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Encode to wire bytes. A `content-length` header is added when the body
    /// is non-empty and none was set.
    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());

        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(b':');
            push_header_part(&mut out, value, escape);
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Encode for a WebSocket text message
    pub fn encode_text(&self) -> String {
        String::from_utf8_lossy(&self.encode()).into_owned()
    }

    /// Body as text, if valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if SENSITIVE_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("Frame")
            .field("command", &self.command)
            .field("headers", &headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn push_header_part(out: &mut Vec<u8>, s: &str, escape: bool) {
    if !escape {
        out.extend_from_slice(s.as_bytes());
        return;
    }
    for c in s.chars() {
        match c {
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            ':' => out.extend_from_slice(b"\\c"),
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape),
        }
    }
    Ok(out)
}

/// Incremental frame parser.
///
/// Bytes may arrive split across WebSocket messages; push them as they come
/// and pull complete frames out.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    limit: usize,
    // Discarding the rest of a bad frame, up to its NUL
    resync: bool,
}

impl FrameReader {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            resync: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` if more bytes are needed.
    ///
    /// Leading heart-beat EOLs are consumed. After an error the rest of the
    /// bad frame is skipped up to its NUL; frames behind it still parse.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.resync && !self.skip_bad_frame() {
            return Ok(None);
        }

        let start = self
            .buf
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(self.buf.len());
        self.buf.drain(..start);

        if self.buf.is_empty() {
            return Ok(None);
        }

        match self.parse() {
            Ok(Some((frame, used))) => {
                self.buf.drain(..used);
                Ok(Some(frame))
            }
            Ok(None) if self.buf.len() > self.limit => {
                self.resync = true;
                self.skip_bad_frame();
                Err(FrameError::TooLarge { limit: self.limit })
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.resync = true;
                self.skip_bad_frame();
                Err(e)
            }
        }
    }

    /// Drop bytes through the next NUL. Returns whether the NUL was found.
    fn skip_bad_frame(&mut self) -> bool {
        match self.buf.iter().position(|b| *b == 0) {
            Some(end) => {
                self.buf.drain(..=end);
                self.resync = false;
                true
            }
            None => {
                self.buf.clear();
                false
            }
        }
    }

    fn parse(&self) -> Result<Option<(Frame, usize)>, FrameError> {
        let Some(head_end) = find(&self.buf, b"\n\n")
            .map(|i| (i, i + 2))
            .into_iter()
            .chain(find(&self.buf, b"\r\n\r\n").map(|i| (i, i + 4)))
            .min_by_key(|(i, _)| *i)
        else {
            return Ok(None);
        };
        let (head_len, body_start) = head_end;

        let head =
            std::str::from_utf8(&self.buf[..head_len]).map_err(|_| FrameError::InvalidUtf8)?;
        let mut lines = head.lines();
        let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            let (name, value) = if command.escapes_headers() {
                (unescape(name)?, unescape(value)?)
            } else {
                (name.to_string(), value.to_string())
            };
            headers.push((name, value));
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let rest = &self.buf[body_start..];
        let body_len = match content_length {
            Some(len) if len > self.limit => return Err(FrameError::TooLarge { limit: self.limit }),
            Some(len) => {
                if rest.len() <= len {
                    return Ok(None);
                }
                if rest[len] != 0 {
                    return Err(FrameError::MissingNul);
                }
                len
            }
            None => match rest.iter().position(|b| *b == 0) {
                Some(len) => len,
                None => return Ok(None),
            },
        };

        let frame = Frame {
            command,
            headers,
            body: rest[..body_len].to_vec(),
        };
        Ok(Some((frame, body_start + body_len + 1)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Negotiated heart-beat intervals; `None` means disabled in that direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

impl Heartbeat {
    /// Header value the client offers in CONNECT
    pub fn offer(outgoing: Duration, incoming: Duration) -> String {
        format!("{},{}", outgoing.as_millis(), incoming.as_millis())
    }

    /// Combine the client's offer with the server's `heart-beat` header
    pub fn negotiate(outgoing: Duration, incoming: Duration, server: Option<&str>) -> Self {
        let (sx, sy) = server
            .and_then(|v| v.split_once(','))
            .and_then(|(x, y)| Some((x.trim().parse::<u64>().ok()?, y.trim().parse::<u64>().ok()?)))
            .unwrap_or((0, 0));
        let (cx, cy) = (outgoing.as_millis() as u64, incoming.as_millis() as u64);

        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        Self {
            outgoing: pick(cx, sy),
            incoming: pick(cy, sx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut FrameReader) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_encode_subscribe() {
        let frame = Frame::new(Command::Subscribe)
            .header("id", "sub-0")
            .header("destination", "/topic/system");
        assert_eq!(
            frame.encode(),
            b"SUBSCRIBE\nid:sub-0\ndestination:/topic/system\n\n\0".to_vec()
        );
    }

    #[test]
    fn test_encode_adds_content_length() {
        let mut frame = Frame::new(Command::Send).header("destination", "/app/x");
        frame.body = b"hi".to_vec();
        assert_eq!(
            frame.encode_text(),
            "SEND\ndestination:/app/x\ncontent-length:2\n\nhi\0"
        );
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = Frame::new(Command::Connect).header("host", "a:b");
        assert_eq!(frame.encode_text(), "CONNECT\nhost:a:b\n\n\0");

        let frame = Frame::new(Command::Subscribe).header("destination", "a:b");
        assert_eq!(frame.encode_text(), "SUBSCRIBE\ndestination:a\\cb\n\n\0");
    }

    #[test]
    fn test_decode_message_with_escapes() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"MESSAGE\nsubscription:sub-1\nx-note:a\\cb\\nc\n\n{\"title\":\"t\"}\0");

        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-1"));
        assert_eq!(frame.get("x-note"), Some("a:b\nc"));
        assert_eq!(frame.body_str(), Some("{\"title\":\"t\"}"));
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_decode_split_across_pushes_and_heartbeats() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"\n\r\nMESSAGE\nsubscr");
        assert!(reader.next_frame().unwrap().is_none());
        reader.push(b"iption:s\n\nbody\0\nERROR\nmessage:bye\n\n\0");

        let frames = read_all(&mut reader);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body, b"body");
        assert_eq!(frames[1].command, Command::Error);
        assert_eq!(frames[1].get("message"), Some("bye"));
    }

    #[test]
    fn test_decode_content_length_allows_nul_in_body() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"MESSAGE\ncontent-length:3\n\na\0b\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.body, b"a\0b");
    }

    #[test]
    fn test_decode_crlf_lines() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"CONNECTED\r\nversion:1.2\r\nheart-beat:0,5000\r\n\r\n\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
        assert_eq!(frame.get("heart-beat"), Some("0,5000"));
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"MESSAGE\nfoo:1\nfoo:2\n\n\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.get("foo"), Some("1"));
    }

    #[test]
    fn test_decode_errors() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"BOGUS\n\n\0");
        assert_eq!(
            reader.next_frame(),
            Err(FrameError::UnknownCommand("BOGUS".into()))
        );

        reader.push(b"MESSAGE\nno-colon\n\n\0");
        assert!(matches!(reader.next_frame(), Err(FrameError::MalformedHeader(_))));

        reader.push(b"MESSAGE\nbad:\\t\n\n\0");
        assert_eq!(reader.next_frame(), Err(FrameError::InvalidEscape));

        reader.push(b"MESSAGE\ncontent-length:1\n\nab\0");
        assert_eq!(reader.next_frame(), Err(FrameError::MissingNul));

        // Each bad frame is skipped through its NUL, so parsing recovers
        reader.push(b"RECEIPT\nreceipt-id:1\n\n\0");
        assert_eq!(reader.next_frame().unwrap().unwrap().command, Command::Receipt);
    }

    #[test]
    fn test_decode_too_large() {
        let mut reader = FrameReader::new(16);
        reader.push(b"MESSAGE\n\n0123456789abcdefghij");
        assert_eq!(reader.next_frame(), Err(FrameError::TooLarge { limit: 16 }));

        // The tail of the oversized frame is skipped when it arrives
        reader.push(b"klmnop\0RECEIPT\nreceipt-id:2\n\n\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, Command::Receipt);
        assert_eq!(frame.get("receipt-id"), Some("2"));

        let mut reader = FrameReader::new(16);
        reader.push(b"MESSAGE\ncontent-length:100\n\n");
        assert_eq!(reader.next_frame(), Err(FrameError::TooLarge { limit: 16 }));
    }

    #[test]
    fn test_bad_frame_does_not_drop_following_frames() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"BOGUS\nx:1\n\nbody\0MESSAGE\nsubscription:sub-1\n\nhi\0\nRECEIPT\n\n\0");

        assert_eq!(
            reader.next_frame(),
            Err(FrameError::UnknownCommand("BOGUS".into()))
        );
        let message = reader.next_frame().unwrap().unwrap();
        assert_eq!(message.command, Command::Message);
        assert_eq!(message.body, b"hi");
        assert_eq!(reader.next_frame().unwrap().unwrap().command, Command::Receipt);
        assert_eq!(reader.next_frame(), Ok(None));
    }

    #[test]
    fn test_bad_frame_split_across_pushes() {
        let mut reader = FrameReader::new(1024);
        reader.push(b"MESSAGE\nno-colon\n\npart");
        assert!(matches!(reader.next_frame(), Err(FrameError::MalformedHeader(_))));

        reader.push(b"ial\0");
        assert_eq!(reader.next_frame(), Ok(None));

        reader.push(b"RECEIPT\nreceipt-id:3\n\n\0");
        assert_eq!(reader.next_frame().unwrap().unwrap().get("receipt-id"), Some("3"));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let frame = Frame::new(Command::Connect)
            .header("Authorization", "Bearer secret-token")
            .header("host", "example.com");
        let debug = format!("{:?}", frame);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("example.com"));
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let ten = Duration::from_secs(10);

        let hb = Heartbeat::negotiate(ten, ten, Some("5000,20000"));
        assert_eq!(hb.outgoing, Some(Duration::from_secs(20)));
        assert_eq!(hb.incoming, Some(ten));

        let hb = Heartbeat::negotiate(ten, ten, Some("0,0"));
        assert_eq!(hb, Heartbeat { outgoing: None, incoming: None });

        let hb = Heartbeat::negotiate(Duration::ZERO, ten, Some("15000,15000"));
        assert_eq!(hb.outgoing, None);
        assert_eq!(hb.incoming, Some(Duration::from_secs(15)));

        let hb = Heartbeat::negotiate(ten, ten, None);
        assert_eq!(hb, Heartbeat { outgoing: None, incoming: None });

        assert_eq!(Heartbeat::offer(ten, Duration::ZERO), "10000,0");
    }
}
