//! STOMP 1.2 frames
//!
//! A frame is a command line, `name:value` header lines, a blank line, the
//! body and a NUL octet. Header values are escaped (`\\`, `\n`, `\r`, `\c`)
//! in every frame except `CONNECT` and `CONNECTED`.

use crate::shared::error::FrameError;

/// Protocol versions offered in `CONNECT`
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// STOMP frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let command = match raw {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

/// Result of decoding one transport message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A bare EOL keep-alive
    Heartbeat,
    Frame(Frame),
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `CONNECT` with the bearer credential attached
    pub fn connect(host: &str, bearer_token: &str, heart_beat: (u64, u64)) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{},{}", heart_beat.0, heart_beat.1))
            .header("Authorization", format!("Bearer {}", bearer_token))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    /// `SEND` with a JSON body
    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).header("receipt", receipt)
    }

    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }

    pub fn subscription(&self) -> Option<&str> {
        self.get("subscription")
    }

    /// `message` header of an `ERROR` frame, or its body
    pub fn error_message(&self) -> String {
        match self.get("message") {
            Some(message) if !message.is_empty() => message.to_string(),
            _ if !self.body.trim().is_empty() => self.body.trim().to_string(),
            _ => "Unknown error".to_string(),
        }
    }

    /// Serialize for the wire
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// A heart-beat frame is a single EOL
pub fn heartbeat() -> &'static str {
    "\n"
}

/// Decode every frame in one transport message.
///
/// A message made only of EOLs is a heart-beat; EOLs between frames are
/// ignored. Fails on the first malformed frame.
pub fn decode_all(input: &str) -> Result<Vec<Decoded>, FrameError> {
    match decode_lossy(input) {
        (_, Some(error)) => Err(error),
        (decoded, None) => Ok(decoded),
    }
}

/// Like [`decode_all`], but keeps the frames that precede a malformed one.
/// Everything from the malformed frame on is lost.
pub fn decode_lossy(input: &str) -> (Vec<Decoded>, Option<FrameError>) {
    let mut decoded = Vec::new();
    let mut rest = input;

    loop {
        let trimmed = rest.trim_start_matches(|c: char| c == '\n' || c == '\r');
        if trimmed.is_empty() {
            if decoded.is_empty() && !rest.is_empty() {
                decoded.push(Decoded::Heartbeat);
            }
            break;
        }
        match decode_one(trimmed) {
            Ok((frame, remaining)) => {
                decoded.push(Decoded::Frame(frame));
                rest = remaining;
            }
            Err(error) => return (decoded, Some(error)),
        }
    }

    if decoded.is_empty() {
        return (decoded, Some(FrameError::Empty));
    }
    (decoded, None)
}

/// Decode exactly one frame, returning what follows its NUL terminator
fn decode_one(input: &str) -> Result<(Frame, &str), FrameError> {
    let (command_line, mut rest) = split_line(input).ok_or(FrameError::Unterminated)?;
    let command = Command::parse(command_line)?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, after) = split_line(rest).ok_or(FrameError::Unterminated)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut frame = Frame {
        command,
        headers,
        body: String::new(),
    };

    let declared = frame
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok());

    let (body, remaining) = match declared {
        Some(length) => {
            let bytes = rest.as_bytes();
            if bytes.len() < length + 1 {
                return Err(FrameError::ContentLength {
                    declared: length,
                    actual: bytes.len().saturating_sub(1),
                });
            }
            if bytes[length] != 0 {
                return Err(FrameError::Unterminated);
            }
            let body = rest.get(..length).ok_or(FrameError::InvalidUtf8)?;
            (body, &rest[length + 1..])
        }
        None => {
            let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    frame.body = body.to_string();
    Ok((frame, remaining))
}

/// Split off one line, accepting `\n` and `\r\n`
fn split_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = input[..end].strip_suffix('\r').unwrap_or(&input[..end]);
    Some((line, &input[end + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
