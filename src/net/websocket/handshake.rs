//! WebSocket opening handshake, server side (RFC 6455 Section 4.2).
//!
//! The server reads one bounded chunk from the client, parses header lines,
//! requires `Sec-WebSocket-Key`, and answers with `101 Switching Protocols`.
//! Anything else about the request (path, origin, version) is left to the
//! [`Handler::validate_client`](crate::server::Handler::validate_client) hook.
//!
//! # Accept token
//!
//! ```text
//! Sec-WebSocket-Accept = base64( SHA1( Sec-WebSocket-Key ++ GUID ) )
//! GUID                 = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11"
//! ```

use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

/// The magic GUID from RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header carrying the client nonce.
pub const KEY_HEADER: &str = "Sec-WebSocket-Key";

/// Compute the `Sec-WebSocket-Accept` value from a client key.
///
/// # Example
///
/// ```
/// use wsrelay::net::websocket::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// WebSocket handshake errors.
#[derive(Debug)]
pub enum HandshakeError {
    /// Nothing usable was received.
    InvalidRequest(String),
    /// Missing required header.
    MissingHeader(&'static str),
    /// I/O error.
    Io(std::io::Error),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid HTTP request: {msg}"),
            Self::MissingHeader(name) => write!(f, "missing required header: {name}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Parsed request headers, in arrival order.
///
/// Lines of the form `Name: Value` (name without whitespace) are kept; other
/// lines are ignored. Parsing stops at the first empty line.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    request_line: Option<String>,
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Parse headers from raw request bytes.
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut headers = Self::default();

        for (index, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                if index == 0 {
                    continue;
                }
                break;
            }
            match split_header(line) {
                Some((name, value)) => headers.entries.push((name.to_string(), value.to_string())),
                None if index == 0 => headers.request_line = Some(line.to_string()),
                None => {}
            }
        }
        headers
    }

    /// Get a header value by name (case-insensitive, first match).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The request line (`GET /path HTTP/1.1`), if one was sent.
    #[must_use]
    pub fn request_line(&self) -> Option<&str> {
        self.request_line.as_deref()
    }

    /// Request path taken from the request line.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.request_line.as_deref()?.split_whitespace().nth(1)
    }

    /// Iterate over `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines parsed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no header lines were parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(": ")?;
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return None;
    }
    Some((name, value))
}

/// The server's answer to an accepted upgrade.
#[derive(Debug, Clone)]
pub struct AcceptResponse {
    /// The computed Sec-WebSocket-Accept value.
    pub accept_key: String,
}

impl AcceptResponse {
    /// Build the response for a client key.
    #[must_use]
    pub fn for_key(client_key: &str) -> Self {
        Self {
            accept_key: compute_accept_key(client_key.trim()),
        }
    }

    /// Generate the HTTP 101 response bytes.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut response = String::from(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n",
        );
        response.push_str("Sec-WebSocket-Accept: ");
        response.push_str(&self.accept_key);
        response.push_str("\r\n\r\n");
        response.into_bytes()
    }
}

/// Parse a client request and produce the upgrade response.
///
/// # Errors
///
/// Returns `HandshakeError::InvalidRequest` for an empty request and
/// `HandshakeError::MissingHeader` when `Sec-WebSocket-Key` is absent.
pub fn accept(data: &[u8]) -> Result<(Headers, AcceptResponse), HandshakeError> {
    if data.is_empty() {
        return Err(HandshakeError::InvalidRequest("empty request".into()));
    }
    let headers = Headers::parse(data);
    let key = headers
        .get(KEY_HEADER)
        .filter(|key| !key.trim().is_empty())
        .ok_or(HandshakeError::MissingHeader(KEY_HEADER))?;
    let response = AcceptResponse::for_key(key);
    Ok((headers, response))
}

/// Generate an HTTP error response for a refused upgrade.
#[must_use]
pub fn reject(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}
