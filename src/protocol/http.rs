//! Minimal HTTP/1.1 codec for the handshake phase.
//!
//! SoftEther speaks plain HTTP/1.1 over the TLS channel until the Welcome
//! completes, then the same byte stream switches to the tunnel framing.
//! Requests carry an exact `Content-Length`; responses using chunked
//! transfer encoding are rejected outright.

use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;

/// Outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub path: String,
    pub content_type: String,
    pub body: Bytes,
}

impl HttpRequest {
    /// POST with an exact-length body.
    pub fn post(path: &str, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            path: path.to_string(),
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }

    /// Serialize the request. `host` lands in the `Host` header verbatim.
    pub fn encode(&self, host: &str) -> Bytes {
        let head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nConnection: Keep-Alive\r\nContent-Length: {}\r\n\r\n",
            self.path,
            host,
            self.content_type,
            self.body.len()
        );
        let mut buf = BytesMut::with_capacity(head.len() + self.body.len());
        buf.extend_from_slice(head.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Parsed HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Streaming response parser. Feed arbitrary chunks; a complete response is
/// returned once status line, headers, and `Content-Length` bytes of body
/// have all arrived. Bytes past the body stay buffered for the caller.
#[derive(Debug, Default)]
pub struct HttpCodec {
    buffer: BytesMut,
    state: State,
    status: u16,
    headers: HashMap<String, String>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    StatusLine,
    Headers,
    Body {
        content_length: usize,
    },
}

impl HttpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state = State::StatusLine;
        self.status = 0;
        self.headers.clear();
        // Buffered bytes belong to whatever follows the previous response
        // and must survive the reset.
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                State::StatusLine => match self.take_line() {
                    Some(line) => {
                        self.status = parse_status(&line)?;
                        self.state = State::Headers;
                    }
                    None => return Ok(None),
                },
                State::Headers => match self.take_line() {
                    Some(line) if line.is_empty() => {
                        if self
                            .headers
                            .get("transfer-encoding")
                            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
                        {
                            return Err(Error::handshake(
                                "server sent chunked transfer encoding",
                            ));
                        }
                        let content_length = self
                            .headers
                            .get("content-length")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        self.state = State::Body { content_length };
                    }
                    Some(line) => {
                        if let Some(pos) = line.find(':') {
                            let key = line[..pos].trim().to_ascii_lowercase();
                            let value = line[pos + 1..].trim().to_string();
                            self.headers.insert(key, value);
                        }
                    }
                    None => return Ok(None),
                },
                State::Body { content_length } => {
                    if self.buffer.len() < content_length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(content_length).freeze();
                    let response = HttpResponse {
                        status: self.status,
                        headers: std::mem::take(&mut self.headers),
                        body,
                    };
                    self.state = State::StatusLine;
                    self.status = 0;
                    return Ok(Some(response));
                }
            }
        }
    }

    /// Bytes buffered beyond the last complete response. The tunnel stream
    /// can begin inside the same TCP segment as the Welcome body, so these
    /// must be handed to the framer rather than discarded.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        self.buffer.advance(pos + 2);
        Some(line)
    }
}

fn parse_status(line: &str) -> Result<u16> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(Error::handshake(format!("bad status line: {line:?}")));
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::handshake(format!("bad status line: {line:?}")))
}
