// GRBL wire protocol.
//
// Lines go out newline-terminated and every accepted line is answered with
// `ok` or `error:N`. Real-time commands are single bytes the controller picks
// out of the stream as soon as they arrive; they never occupy its receive
// buffer and are never acknowledged.

use std::io::{self, Read};

pub mod realtime {
    pub const STATUS: u8 = b'?';
    pub const FEED_HOLD: u8 = b'!';
    pub const RESUME: u8 = b'~';
    pub const SOFT_RESET: u8 = 0x18;

    pub fn is_realtime(byte: u8) -> bool {
        matches!(byte, STATUS | FEED_HOLD | RESUME | SOFT_RESET)
    }
}

/// Bytes that wake a freshly opened controller.
pub const WAKE_UP: &[u8] = b"\r\n\r\n";

/// `<Idle|MPos:1.000,2.000,0.000|FS:0,0>`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: String,
    pub machine_position: Option<Vec<f64>>,
}

impl StatusReport {
    fn parse(body: &str) -> Self {
        let mut fields = body.split('|');
        let state = fields.next().unwrap_or_default().to_string();
        let machine_position = fields
            .find_map(|field| field.strip_prefix("MPos:"))
            .and_then(|values| values.split(',').map(|v| v.trim().parse().ok()).collect());
        Self {
            state,
            machine_position,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Error(u32),
    Alarm(String),
    Status(StatusReport),
    /// `[...]` feedback messages.
    Message(String),
    /// Start-up banner; seen mid-session it means the controller reset.
    Banner(String),
    Unknown(String),
}

pub fn parse_response(line: &str) -> Response {
    let line = line.trim();
    if line == "ok" {
        return Response::Ok;
    }
    if let Some(code) = line.strip_prefix("error:") {
        return match code.trim().parse() {
            Ok(code) => Response::Error(code),
            Err(_) => Response::Unknown(line.to_string()),
        };
    }
    if let Some(alarm) = line.strip_prefix("ALARM:") {
        return Response::Alarm(alarm.trim().to_string());
    }
    if let Some(body) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
        return Response::Status(StatusReport::parse(body));
    }
    if let Some(body) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        return Response::Message(body.to_string());
    }
    if line.starts_with("Grbl ") {
        return Response::Banner(line.to_string());
    }
    Response::Unknown(line.to_string())
}

/// Longest response line accepted when no buffer size is known.
pub const DEFAULT_LINE_LIMIT: usize = 256;

/// Line limit for a controller with the given receive buffer.
pub fn response_limit(rx_buffer_size: usize) -> usize {
    (4 * rx_buffer_size).max(DEFAULT_LINE_LIMIT)
}

/// Splits a byte stream with read timeouts into trimmed, non-empty lines.
pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    limit: usize,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, DEFAULT_LINE_LIMIT)
    }

    /// Bytes without a newline beyond `limit` fail with `InvalidData`.
    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            limit,
        }
    }

    /// Next complete line, or `None` when the read timed out first.
    /// End of stream is reported as `UnexpectedEof`.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if !line.is_empty() {
                    return Ok(Some(line));
                }
            }
            if self.buffer.len() > self.limit {
                let len = self.buffer.len();
                self.buffer.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{len} bytes from the controller without a line break"),
                ));
            }

            let mut chunk = [0u8; 256];
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "controller closed the connection",
                    ));
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}
