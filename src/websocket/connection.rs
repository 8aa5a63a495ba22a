//! A peer socket and its negotiated WebSocket state.

use crate::websocket::upgrade::Headers;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global connection ID counter.
static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wsc{}", self.0)
    }
}

/// Snapshot of a connection handed to event handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Connection id.
    pub id: ConnectionId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Negotiated path.
    pub path: String,
}

/// Result of draining a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    /// Bytes appended to the read buffer.
    pub bytes: usize,
    /// The peer closed its side.
    pub eof: bool,
}

/// A WebSocket peer connection.
#[derive(Debug)]
pub struct Connection {
    /// Connection ID for tracking.
    id: ConnectionId,

    /// The underlying socket.
    stream: TcpStream,

    /// Poll token identifying the socket.
    token: Token,

    /// Remote peer address.
    peer_addr: SocketAddr,

    /// Whether the opening handshake completed.
    handshake: bool,

    /// Handshake headers.
    headers: Headers,

    /// Requested path.
    path: String,

    /// Bytes received but not yet consumed.
    read_buf: BytesMut,

    /// Accept or connect time. Bounds how long the opening request may take.
    created_at: Instant,
}

impl Connection {
    /// Wrap an accepted or connected socket.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, token: Token) -> Self {
        Self {
            id: ConnectionId::next(),
            stream,
            token,
            peer_addr,
            handshake: false,
            headers: Headers::new(),
            path: "/".to_string(),
            read_buf: BytesMut::new(),
            created_at: Instant::now(),
        }
    }

    /// Get the connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the poll token of the socket.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the opening handshake completed.
    pub fn is_upgraded(&self) -> bool {
        self.handshake
    }

    /// Handshake headers, names as received.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Requested path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Time since the socket was accepted or connected.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Snapshot for event handlers.
    pub fn peer(&self) -> Peer {
        Peer {
            id: self.id,
            addr: self.peer_addr,
            path: self.path.clone(),
        }
    }

    /// Record a completed handshake. Has no effect once upgraded.
    pub fn complete_handshake(&mut self, path: String, headers: Headers) {
        if self.handshake {
            return;
        }
        self.path = path;
        self.headers = headers;
        self.handshake = true;
    }

    /// Pending input.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Get mutable access to the underlying socket.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read everything currently available, `chunk` bytes at a time.
    pub fn read_available(&mut self, chunk: usize) -> io::Result<ReadStatus> {
        let mut status = ReadStatus {
            bytes: 0,
            eof: false,
        };
        let mut buf = vec![0u8; chunk.max(1)];

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    status.eof = true;
                    break;
                },
                Ok(n) => {
                    self.read_buf.extend_from_slice(&buf[..n]);
                    status.bytes += n;
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(status)
    }

    /// Write `data` with a single call. Short writes are not retried.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    /// Shut down both directions of the socket.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::upgrade::find_header;
    use std::net::TcpListener;

    fn pair() -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(TcpStream::from_std(server), addr, Token(1));
        (conn, client)
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _ca) = pair();
        let (b, _cb) = pair();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("wsc"));
    }

    #[test]
    fn test_defaults_before_handshake() {
        let (conn, _client) = pair();
        assert!(!conn.is_upgraded());
        assert_eq!(conn.path(), "/");
        assert!(conn.headers().is_empty());
        assert_eq!(conn.token(), Token(1));
        assert!(conn.age() < Duration::from_secs(5));
    }

    #[test]
    fn test_complete_handshake_once() {
        let (mut conn, _client) = pair();
        let mut headers = Headers::new();
        headers.insert("Origin".to_string(), "http://example.com".to_string());

        conn.complete_handshake("/chat".to_string(), headers);
        assert!(conn.is_upgraded());
        assert_eq!(conn.path(), "/chat");
        assert_eq!(
            find_header(conn.headers(), "origin"),
            Some("http://example.com")
        );

        conn.complete_handshake("/other".to_string(), Headers::new());
        assert_eq!(conn.path(), "/chat");
        assert_eq!(conn.peer().path, "/chat");
    }

    #[test]
    fn test_read_available_and_eof() {
        let (mut conn, mut client) = pair();
        client.write_all(b"hello").unwrap();
        client.flush().unwrap();

        let mut total = 0;
        for _ in 0..100 {
            total += conn.read_available(2).unwrap().bytes;
            if total == 5 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&conn.read_buf()[..], b"hello");

        drop(client);
        let mut eof = false;
        for _ in 0..100 {
            if conn.read_available(16).unwrap().eof {
                eof = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(eof);
    }
}
