//! Live connection set of one engine.

use crate::websocket::connection::{Connection, ConnectionId};
use mio::Token;

/// Ordered set of connections keyed by socket.
///
/// Lookups are linear scans; iteration follows insertion order.
#[derive(Debug, Default)]
pub struct Registry {
    connections: Vec<Connection>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns it back if its socket is already present.
    pub fn add(&mut self, conn: Connection) -> Result<(), Connection> {
        if self.contains(conn.token()) {
            return Err(conn);
        }
        self.connections.push(conn);
        Ok(())
    }

    /// Remove the connection owning `token`.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        let index = self.connections.iter().position(|c| c.token() == token)?;
        Some(self.connections.remove(index))
    }

    /// Whether a connection owns `token`.
    pub fn contains(&self, token: Token) -> bool {
        self.connections.iter().any(|c| c.token() == token)
    }

    /// Find the connection owning `token`.
    pub fn find_by_token(&self, token: Token) -> Option<&Connection> {
        self.connections.iter().find(|c| c.token() == token)
    }

    /// Find the connection owning `token`, mutably.
    pub fn find_by_token_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.token() == token)
    }

    /// Find a connection by id.
    pub fn find_by_id(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id() == id)
    }

    /// Upgraded connections negotiated on `path`.
    pub fn filter_by_path<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections
            .iter()
            .filter(move |c| c.is_upgraded() && c.path() == path)
    }

    /// All connections, pending handshakes included.
    pub fn all(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Tokens of all connections, in insertion order.
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.iter().map(Connection::token).collect()
    }
}
