//! WebSocket HTTP upgrade handling.
//!
//! Implements both sides of the opening handshake per RFC 6455.

use crate::websocket::error::{WebSocketError, WebSocketResult};
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// WebSocket magic GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// End of an HTTP request or response head.
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Header map, names kept as received.
pub type Headers = HashMap<String, String>;

/// Look up a header by name, ignoring ASCII case.
pub fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Length of the HTTP head at the start of `buf`, terminator included.
///
/// Returns `None` until the blank line ending the head has arrived.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Parse `Name: Value` lines after the first line of an HTTP head.
///
/// Lines are split on the first colon and trimmed; lines without a value
/// are skipped.
pub fn parse_headers(head: &str) -> Headers {
    let mut headers = HashMap::new();
    for line in head.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if !value.is_empty() {
                headers.insert(name.trim().to_string(), value.to_string());
            }
        }
    }
    headers
}

/// Parsed client upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request path, `/` when the request line carries none.
    pub path: String,

    /// Sec-WebSocket-Key header.
    pub key: String,

    /// Origin header.
    pub origin: Option<String>,

    /// All headers.
    pub headers: Headers,
}

impl UpgradeRequest {
    /// Parse an HTTP upgrade request head.
    pub fn parse(request: &[u8]) -> WebSocketResult<Self> {
        let request_str = std::str::from_utf8(request)
            .map_err(|_| WebSocketError::Handshake("request is not valid UTF-8".to_string()))?;

        let path = request_str
            .lines()
            .next()
            .and_then(request_path)
            .unwrap_or("/")
            .to_string();

        let headers = parse_headers(request_str);

        let key = find_header(&headers, "Sec-WebSocket-Key")
            .ok_or_else(|| WebSocketError::Handshake("missing Sec-WebSocket-Key".to_string()))?
            .to_string();

        let origin = find_header(&headers, "Origin").map(str::to_string);

        Ok(Self {
            path,
            key,
            origin,
            headers,
        })
    }
}

/// Extract `<path>` from `GET <path> HTTP/...`.
fn request_path(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("GET ")?;
    let end = rest.rfind(" HTTP")?;
    let path = rest[..end].trim();
    (!path.is_empty()).then_some(path)
}

/// Build the `101` response accepting `key`.
pub fn build_response(key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        compute_accept_key(key)
    )
    .into_bytes()
}

/// Compute Sec-WebSocket-Accept value from client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Check if origin is allowed.
///
/// An empty allow-list admits everything. Otherwise the host of the
/// `Origin` URL must equal one of the entries.
pub fn check_origin(origin: Option<&str>, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let Some(host) = origin
        .and_then(|o| url::Url::parse(o).ok())
        .and_then(|u| u.host_str().map(str::to_string))
    else {
        return false;
    };

    allowed.iter().any(|a| *a == host)
}

/// Client side of the opening handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    /// Start a handshake with a fresh random key.
    pub fn new() -> Self {
        let raw: Vec<u8> = rand::rng().sample_iter(Alphanumeric).take(16).collect();
        Self {
            key: base64::engine::general_purpose::STANDARD.encode(raw),
        }
    }

    /// The Sec-WebSocket-Key sent to the server.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the upgrade request.
    pub fn request(
        &self,
        host: &str,
        port: u16,
        path: &str,
        origin: Option<&str>,
        user_agent: &str,
    ) -> Vec<u8> {
        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             User-Agent: {user_agent}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n",
            self.key
        );
        if let Some(origin) = origin.filter(|o| !o.is_empty()) {
            request.push_str(&format!("Origin: {origin}\r\n"));
        }
        request.push_str("Sec-WebSocket-Version: 13\r\n\r\n");
        request.into_bytes()
    }

    /// Check the server's response head and return its headers.
    pub fn verify(&self, response: &[u8]) -> WebSocketResult<Headers> {
        let response_str = std::str::from_utf8(response)
            .map_err(|_| WebSocketError::Handshake("response is not valid UTF-8".to_string()))?;
        let headers = parse_headers(response_str);

        let accept = find_header(&headers, "Sec-WebSocket-Accept")
            .ok_or_else(|| WebSocketError::Handshake("missing Sec-WebSocket-Accept".to_string()))?;

        if accept != compute_accept_key(&self.key) {
            return Err(WebSocketError::Handshake(
                "Sec-WebSocket-Accept mismatch".to_string(),
            ));
        }

        Ok(headers)
    }
}
