//! The connection multiplexing loop.
//!
//! An [`Engine`] owns one poller, its connections and its event handlers.
//! Everything runs on the calling thread: the engine blocks only inside the
//! readiness wait, and handlers run to completion before the next socket is
//! serviced.
//!
//! Handlers receive the engine's [`Hub`], the part of the engine that holds
//! the connections. Anything a handler does through the hub (sending,
//! disconnecting) may raise further events; they are queued and dispatched
//! once the handler returns.

use crate::config::EngineConfig;
use crate::websocket::connection::{Connection, ConnectionId, Peer, ReadStatus};
use crate::websocket::error::{WebSocketError, WebSocketResult};
use crate::websocket::events::{Dispatcher, Event, EventKind, HandlerResult, TransportErrorInfo};
use crate::websocket::frame::{
    self, close_payload, parse_close_payload, CloseCode, Frame, FrameDecoder, OpCode,
};
use crate::websocket::registry::Registry;
use crate::websocket::stats::EngineStats;
use crate::websocket::upgrade::{
    build_response, check_origin, head_len, ClientHandshake, UpgradeRequest,
};
use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll token of the listening socket.
const LISTENER: Token = Token(0);

/// Readiness events fetched per wait.
const EVENTS_CAPACITY: usize = 1024;

const REASON_MAX_CLIENTS: &str = "Max clients limit reached";
const REASON_HANDSHAKE: &str = "Failed process handshake";
const REASON_ORIGIN: &str = "Invalid origin";

/// Which end of the protocol an engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts connections and answers handshakes.
    Server,
    /// Opens connections and masks every frame it sends.
    Client,
}

impl Role {
    fn masks_outbound(&self) -> bool {
        matches!(self, Self::Client)
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created, nothing opened.
    Idle,
    /// Server listening, loop not started.
    Bound,
    /// Client has at least one open connection.
    Connected,
    /// Server loop running.
    Serving,
    /// Every connection and the listener closed.
    Stopped,
}

/// Requests a cooperative stop from any thread.
///
/// The engine observes the request at the start of its next iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the engine to stop.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    Pending,
    Upgraded,
    Closed,
}

/// Connections of one engine and the operations handlers may perform on
/// them.
#[derive(Debug)]
pub struct Hub {
    role: Role,
    config: EngineConfig,
    registry: Registry,
    stats: EngineStats,
    decoder: FrameDecoder,
    poll: mio::Registry,
    pending: VecDeque<Event>,
    stop: StopHandle,
}

impl Hub {
    /// The engine's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Counters so far.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Look up a live connection, handshake pending or not.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.registry.find_by_id(id)
    }

    /// Every upgraded connection, in connection order.
    pub fn connections(&self) -> Vec<Peer> {
        self.registry
            .all()
            .filter(|c| c.is_upgraded())
            .map(Connection::peer)
            .collect()
    }

    /// Upgraded connections negotiated on `path`.
    pub fn connections_by_path(&self, path: &str) -> Vec<Peer> {
        self.registry
            .filter_by_path(path)
            .map(Connection::peer)
            .collect()
    }

    /// Send a text message and raise `send`.
    ///
    /// Nothing is written to connections that are gone or still
    /// handshaking.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::UnknownConnection`] for such connections,
    /// [`WebSocketError::Transport`] if the write fails.
    pub fn send(&mut self, id: ConnectionId, text: &str) -> WebSocketResult<()> {
        let token = self.upgraded_token(id)?;
        let bytes = frame::encode(text.as_bytes(), OpCode::Text, self.role.masks_outbound())?;
        let peer = self.write_frame(token, &bytes)?;

        self.stats.message_sent();
        debug!(conn = %id, len = text.len(), "Sent text");
        self.pending.push_back(Event::Send {
            peer,
            payload: text.to_string(),
        });
        Ok(())
    }

    /// Send `text` to every connection on `path`. Returns how many writes
    /// succeeded.
    pub fn broadcast(&mut self, path: &str, text: &str) -> usize {
        let ids: Vec<ConnectionId> = self.registry.filter_by_path(path).map(|c| c.id()).collect();
        ids.into_iter()
            .filter(|id| self.send(*id, text).is_ok())
            .count()
    }

    /// Send a ping.
    ///
    /// # Errors
    ///
    /// Same as [`Hub::send`].
    pub fn ping(&mut self, id: ConnectionId, payload: &[u8]) -> WebSocketResult<()> {
        let token = self.upgraded_token(id)?;
        let bytes = frame::encode(payload, OpCode::Ping, self.role.masks_outbound())?;
        self.write_frame(token, &bytes)?;
        debug!(conn = %id, "Sent ping");
        Ok(())
    }

    /// Close a connection with `code` and `reason`, then raise `disconnect`.
    ///
    /// An empty reason is replaced by the code's default. Returns `false` if
    /// the connection was already gone.
    pub fn disconnect(&mut self, id: ConnectionId, code: CloseCode, reason: &str) -> bool {
        match self.registry.find_by_id(id).map(Connection::token) {
            Some(token) => self.close_token(token, code, reason),
            None => false,
        }
    }

    /// Ask the engine to stop after the current iteration.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    fn upgraded_token(&self, id: ConnectionId) -> WebSocketResult<Token> {
        self.registry
            .find_by_id(id)
            .filter(|c| c.is_upgraded())
            .map(Connection::token)
            .ok_or(WebSocketError::UnknownConnection(id))
    }

    /// Single best-effort write. Failures raise `error`.
    fn write_frame(&mut self, token: Token, bytes: &[u8]) -> WebSocketResult<Peer> {
        let conn = self
            .registry
            .find_by_token_mut(token)
            .ok_or_else(|| WebSocketError::transport("write", io::ErrorKind::NotFound.into()))?;
        let peer = conn.peer();

        match conn.write(bytes) {
            Ok(n) => {
                if n < bytes.len() {
                    debug!(conn = %peer.id, written = n, len = bytes.len(), "Short write");
                }
                self.stats.bytes_out(n);
                Ok(peer)
            },
            Err(e) => {
                self.report("write", Some(peer), &e);
                Err(WebSocketError::transport("write", e))
            },
        }
    }

    fn report(&mut self, op: &'static str, peer: Option<Peer>, err: &io::Error) {
        self.stats.transport_error();
        warn!(op, conn = ?peer.as_ref().map(|p| p.id), error = %err, "Socket error");
        self.pending.push_back(Event::Error {
            peer,
            info: TransportErrorInfo::new(op, err),
        });
    }

    fn is_upgraded(&self, token: Token) -> bool {
        self.registry
            .find_by_token(token)
            .is_some_and(Connection::is_upgraded)
    }

    fn admit(&mut self, conn: Connection) {
        match self.registry.add(conn) {
            Ok(()) => self.stats.connection_opened(),
            Err(mut conn) => {
                warn!(conn = %conn.id(), "Socket already registered");
                let _ = self.poll.deregister(conn.stream_mut());
                conn.shutdown();
            },
        }
    }

    /// Turn away a connection accepted while full. No events are raised.
    fn reject(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let err = WebSocketError::CapacityExceeded {
            max: self.config.max_clients,
        };
        warn!(addr = %addr, error = %err, "Rejecting connection");

        // Drop whatever the peer already sent so the close is not reset.
        let mut scratch = [0u8; 512];
        while matches!(stream.read(&mut scratch), Ok(n) if n > 0) {}

        let payload = close_payload(err.close_code(), REASON_MAX_CLIENTS);
        if let Ok(bytes) = frame::encode(&payload, OpCode::Close, self.role.masks_outbound()) {
            match stream.write(&bytes) {
                Ok(n) => {
                    self.stats.bytes_out(n);
                    self.stats.close_sent();
                },
                Err(e) => debug!(addr = %addr, error = %e, "Close frame not delivered"),
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
        self.stats.connection_rejected();
    }

    /// Write a close frame, drop the socket and raise `disconnect` for
    /// upgraded connections. Returns `false` if `token` was not live.
    fn close_token(&mut self, token: Token, code: CloseCode, reason: &str) -> bool {
        let Some(mut conn) = self.registry.remove(token) else {
            return false;
        };
        let reason = if reason.is_empty() {
            code.default_reason().to_string()
        } else {
            reason.to_string()
        };

        let payload = close_payload(code, &reason);
        if let Ok(bytes) = frame::encode(&payload, OpCode::Close, self.role.masks_outbound()) {
            match conn.write(&bytes) {
                Ok(n) => {
                    self.stats.bytes_out(n);
                    self.stats.close_sent();
                },
                Err(e) => debug!(conn = %conn.id(), error = %e, "Close frame not delivered"),
            }
        }

        if let Err(e) = self.poll.deregister(conn.stream_mut()) {
            debug!(conn = %conn.id(), error = %e, "Deregister failed");
        }
        conn.shutdown();
        self.stats.connection_closed();

        info!(conn = %conn.id(), code = u16::from(code), reason = %reason, "Disconnected");
        if conn.is_upgraded() {
            self.pending.push_back(Event::Disconnect {
                peer: conn.peer(),
                code,
                reason,
            });
        }
        true
    }

    /// Drain the socket into the connection's buffer.
    fn fill(&mut self, token: Token) -> Option<ReadStatus> {
        let chunk = self.config.buffer_size;
        let conn = self.registry.find_by_token_mut(token)?;

        match conn.read_available(chunk) {
            Ok(status) => {
                self.stats.bytes_in(status.bytes);
                Some(status)
            },
            Err(e) => {
                let peer = conn.peer();
                self.report("read", Some(peer), &e);
                self.close_token(token, CloseCode::Protocol, "");
                None
            },
        }
    }

    /// Answer the opening request once its head has fully arrived.
    fn advance_handshake(&mut self, token: Token) -> HandshakeStep {
        let max = self.config.max_handshake_size;
        let Some(conn) = self.registry.find_by_token_mut(token) else {
            return HandshakeStep::Closed;
        };
        let id = conn.id();
        let addr = conn.peer_addr();

        let Some(len) = head_len(&conn.read_buf()[..]) else {
            if conn.read_buf().len() > max {
                warn!(conn = %id, addr = %addr, max, "Handshake request too large");
                return self.fail_handshake(token, REASON_HANDSHAKE);
            }
            return HandshakeStep::Pending;
        };

        let head = conn.read_buf().split_to(len);
        let request = match UpgradeRequest::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = %id, addr = %addr, error = %e, "Invalid upgrade request");
                return self.fail_handshake(token, REASON_HANDSHAKE);
            },
        };

        let response = build_response(&request.key);
        match conn.write(&response) {
            Ok(n) => self.stats.bytes_out(n),
            Err(e) => {
                let peer = conn.peer();
                self.report("write", Some(peer), &e);
                return self.fail_handshake(token, REASON_HANDSHAKE);
            },
        }

        if !check_origin(request.origin.as_deref(), &self.config.allowed_origins) {
            let err = WebSocketError::OriginNotAllowed(request.origin);
            warn!(conn = %id, addr = %addr, error = %err, "Origin rejected");
            return self.fail_handshake(token, REASON_ORIGIN);
        }

        let Some(conn) = self.registry.find_by_token_mut(token) else {
            return HandshakeStep::Closed;
        };
        conn.complete_handshake(request.path, request.headers);
        self.stats.upgrade_success();
        info!(conn = %id, addr = %addr, path = %conn.path(), "Connected");
        self.pending.push_back(Event::Connect { peer: conn.peer() });
        HandshakeStep::Upgraded
    }

    /// Close connections whose opening request did not complete within
    /// `handshake_timeout`.
    fn expire_handshakes(&mut self) {
        let timeout = self.config.handshake_timeout;
        let stale: Vec<(Token, ConnectionId, SocketAddr)> = self
            .registry
            .all()
            .filter(|c| !c.is_upgraded() && c.age() >= timeout)
            .map(|c| (c.token(), c.id(), c.peer_addr()))
            .collect();

        for (token, id, addr) in stale {
            warn!(conn = %id, addr = %addr, ?timeout, "Handshake timed out");
            self.fail_handshake(token, REASON_HANDSHAKE);
        }
    }

    fn fail_handshake(&mut self, token: Token, reason: &str) -> HandshakeStep {
        self.stats.upgrade_failed();
        self.close_token(token, CloseCode::Protocol, reason);
        HandshakeStep::Closed
    }

    /// Take the next complete frame off an upgraded connection.
    ///
    /// Decode errors and unmasked client frames close the connection.
    fn next_frame(&mut self, token: Token) -> Option<Frame> {
        let decoder = self.decoder;
        let role = self.role;
        let conn = self.registry.find_by_token_mut(token)?;
        if !conn.is_upgraded() {
            return None;
        }
        let id = conn.id();

        match decoder.decode(conn.read_buf()) {
            Ok(Some(decoded)) => {
                if role == Role::Server && !decoded.masked {
                    warn!(
                        conn = %id,
                        opcode = ?decoded.frame.opcode(),
                        len = decoded.frame.payload().len(),
                        "Unmasked frame from client"
                    );
                    self.stats.protocol_error();
                    self.close_token(token, CloseCode::Protocol, "");
                    return None;
                }
                Some(decoded.frame)
            },
            Ok(None) => None,
            Err(e) => {
                warn!(conn = %id, error = %e, "Can't decode frame");
                self.stats.protocol_error();
                self.close_token(token, e.close_code(), "");
                None
            },
        }
    }

    fn handle_frame(&mut self, token: Token, frame: Frame) {
        let Some(peer) = self.registry.find_by_token(token).map(Connection::peer) else {
            return;
        };

        match frame {
            Frame::Text(payload) => match String::from_utf8(payload.to_vec()) {
                Ok(text) => {
                    self.stats.message_received();
                    debug!(conn = %peer.id, len = text.len(), "Received text");
                    self.pending.push_back(Event::Receive {
                        peer,
                        payload: text,
                    });
                },
                Err(_) => {
                    let err = WebSocketError::InvalidUtf8;
                    warn!(conn = %peer.id, error = %err, "Rejecting text frame");
                    self.stats.protocol_error();
                    self.close_token(token, err.close_code(), "");
                },
            },
            Frame::Ping(payload) => {
                self.stats.ping_received();
                debug!(conn = %peer.id, "ping");
                if let Ok(pong) = frame::encode(&payload, OpCode::Pong, self.role.masks_outbound()) {
                    let _ = self.write_frame(token, &pong);
                }
                self.pending.push_back(Event::Ping { peer, payload });
            },
            Frame::Pong(payload) => {
                self.stats.pong_received();
                debug!(conn = %peer.id, "pong");
                self.pending.push_back(Event::Pong { peer, payload });
            },
            Frame::Close(payload) => {
                let (code, reason) = parse_close_payload(&payload);
                debug!(conn = %peer.id, code = u16::from(code), "Close frame received");
                self.close_token(token, code, &reason);
            },
        }
    }
}

/// A WebSocket server or client.
#[derive(Debug)]
pub struct Engine {
    dispatcher: Dispatcher<Hub>,
    hub: Hub,
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    state: EngineState,
    next_token: usize,
}

impl Engine {
    /// Create a server engine. Nothing is bound until [`Engine::bind`] or
    /// [`Engine::run`].
    ///
    /// # Errors
    ///
    /// Fails if the poller cannot be created.
    pub fn server(config: EngineConfig) -> WebSocketResult<Self> {
        Self::new(config, Role::Server)
    }

    /// Create a client engine.
    ///
    /// # Errors
    ///
    /// Fails if the poller cannot be created.
    pub fn client(config: EngineConfig) -> WebSocketResult<Self> {
        Self::new(config, Role::Client)
    }

    fn new(config: EngineConfig, role: Role) -> WebSocketResult<Self> {
        let poll = Poll::new().map_err(|e| WebSocketError::transport("poll", e))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| WebSocketError::transport("poll", e))?;

        let hub = Hub {
            role,
            decoder: FrameDecoder::new(config.max_frame_size),
            config,
            registry: Registry::new(),
            stats: EngineStats::default(),
            poll: registry,
            pending: VecDeque::new(),
            stop: StopHandle::default(),
        };

        Ok(Self {
            dispatcher: Dispatcher::new(),
            hub,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: None,
            local_addr: None,
            state: EngineState::Idle,
            next_token: LISTENER.0 + 1,
        })
    }

    /// Subscribe to every `name` event.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::InvalidSubscription`] for empty or unknown names.
    pub fn on<F>(&mut self, name: &str, handler: F) -> WebSocketResult<()>
    where
        F: FnMut(&mut Hub, &Event) -> HandlerResult + Send + 'static,
    {
        self.dispatcher.on(name, handler)
    }

    /// Subscribe to the next `name` event only.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::InvalidSubscription`] for empty or unknown names.
    pub fn once<F>(&mut self, name: &str, handler: F) -> WebSocketResult<()>
    where
        F: FnMut(&mut Hub, &Event) -> HandlerResult + Send + 'static,
    {
        self.dispatcher.once(name, handler)
    }

    /// Number of handlers subscribed to `kind`.
    pub fn subscribers(&self, kind: EventKind) -> usize {
        self.dispatcher.subscribers(kind)
    }

    /// The engine's role.
    pub fn role(&self) -> Role {
        self.hub.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Listening address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Handle for stopping the engine from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.hub.stop.clone()
    }

    /// The connection side of the engine.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Counters so far.
    pub fn stats(&self) -> EngineStats {
        self.hub.stats.clone()
    }

    /// See [`Hub::connection`].
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.hub.connection(id)
    }

    /// See [`Hub::connections`].
    pub fn connections(&self) -> Vec<Peer> {
        self.hub.connections()
    }

    /// See [`Hub::connections_by_path`].
    pub fn connections_by_path(&self, path: &str) -> Vec<Peer> {
        self.hub.connections_by_path(path)
    }

    /// See [`Hub::send`].
    ///
    /// # Errors
    ///
    /// Same as [`Hub::send`].
    pub fn send(&mut self, id: ConnectionId, text: &str) -> WebSocketResult<()> {
        let result = self.hub.send(id, text);
        self.flush_events();
        result
    }

    /// See [`Hub::broadcast`].
    pub fn broadcast(&mut self, path: &str, text: &str) -> usize {
        let sent = self.hub.broadcast(path, text);
        self.flush_events();
        sent
    }

    /// See [`Hub::ping`].
    ///
    /// # Errors
    ///
    /// Same as [`Hub::send`].
    pub fn ping(&mut self, id: ConnectionId, payload: &[u8]) -> WebSocketResult<()> {
        let result = self.hub.ping(id, payload);
        self.flush_events();
        result
    }

    /// See [`Hub::disconnect`].
    pub fn disconnect(&mut self, id: ConnectionId, code: CloseCode, reason: &str) -> bool {
        let closed = self.hub.disconnect(id, code, reason);
        self.flush_events();
        closed
    }

    /// Bind and listen on the configured address.
    ///
    /// # Errors
    ///
    /// Fails on client engines, after [`Engine::stop`], or when the address
    /// cannot be resolved or bound.
    pub fn bind(&mut self) -> WebSocketResult<SocketAddr> {
        self.require(Role::Server, "bind")?;
        if self.state == EngineState::Stopped {
            return Err(WebSocketError::Stopped("bind"));
        }
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let addr = self.hub.config.socket_addr()?;
        let mut listener =
            TcpListener::bind(addr).map_err(|e| WebSocketError::transport("bind", e))?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|e| WebSocketError::transport("register", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| WebSocketError::transport("bind", e))?;

        self.listener = Some(listener);
        self.local_addr = Some(local);
        self.state = EngineState::Bound;
        info!(addr = %local, "WebSocket server listening");
        Ok(local)
    }

    /// Serve until stopped.
    ///
    /// # Errors
    ///
    /// Fails on client engines or if binding fails.
    pub fn run(&mut self) -> WebSocketResult<()> {
        while self.state != EngineState::Stopped {
            self.run_once()?;
        }
        Ok(())
    }

    /// One server iteration: wait up to `poll_timeout`, then service every
    /// ready socket. Returns the number of ready sockets.
    ///
    /// A failed wait is raised as an `error` event and the iteration ends
    /// with no sockets serviced.
    ///
    /// # Errors
    ///
    /// Fails on client engines or if binding fails.
    pub fn run_once(&mut self) -> WebSocketResult<usize> {
        self.require(Role::Server, "run")?;
        if self.hub.stop.is_stopped() {
            self.stop();
        }
        match self.state {
            EngineState::Stopped => return Ok(0),
            EngineState::Idle => {
                self.bind()?;
            },
            _ => {},
        }
        if self.state == EngineState::Bound {
            self.state = EngineState::Serving;
            self.hub.stats.started();
        }

        let timeout = self.hub.config.poll_timeout;
        Ok(self.turn(timeout))
    }

    /// Open a connection to the configured address and run the client
    /// handshake for `path`.
    ///
    /// # Errors
    ///
    /// Fails on server engines, after [`Engine::stop`], when the connection
    /// cannot be opened, or when the handshake fails. A failed handshake is answered with a 1002 close.
    pub fn connect(&mut self, path: &str, origin: Option<&str>) -> WebSocketResult<ConnectionId> {
        self.require(Role::Client, "connect")?;
        if self.state == EngineState::Stopped {
            return Err(WebSocketError::Stopped("connect"));
        }

        let config = &self.hub.config;
        let addr = config.socket_addr()?;
        let timeout = config.handshake_timeout;
        let mut stream = std::net::TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| WebSocketError::transport("connect", e))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| WebSocketError::transport("connect", e))?;

        let handshake = ClientHandshake::new();
        let request = handshake.request(&config.address, config.port, path, origin, &config.user_agent);
        stream
            .write_all(&request)
            .map_err(|e| WebSocketError::transport("write", e))?;

        let mut buf = BytesMut::new();
        let verified = read_head(&mut stream, &mut buf, config.buffer_size, config.max_handshake_size)
            .and_then(|head| handshake.verify(&head));
        let headers = match verified {
            Ok(headers) => headers,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Client handshake failed");
                self.hub.stats.upgrade_failed();
                abort_handshake(&mut stream);
                return Err(e);
            },
        };

        stream
            .set_read_timeout(None)
            .and_then(|()| stream.set_nonblocking(true))
            .map_err(|e| WebSocketError::transport("connect", e))?;
        let mut stream = TcpStream::from_std(stream);
        let token = self.next_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
            .map_err(|e| WebSocketError::transport("register", e))?;

        let mut conn = Connection::new(stream, addr, token);
        conn.complete_handshake(path.to_string(), headers);
        conn.read_buf().extend_from_slice(&buf);
        let id = conn.id();
        let peer = conn.peer();

        self.hub.admit(conn);
        self.hub.stats.upgrade_success();
        if self.state == EngineState::Idle {
            self.state = EngineState::Connected;
            self.hub.stats.started();
        }
        info!(conn = %id, addr = %addr, path, "Connected");
        self.hub.pending.push_back(Event::Connect { peer });
        self.flush_events();

        // The server may have sent frames right behind its response.
        self.drain_frames(token);
        Ok(id)
    }

    /// One client iteration: wait up to `timeout` for server frames and
    /// dispatch them. Returns the number of ready sockets.
    ///
    /// # Errors
    ///
    /// Fails on server engines.
    pub fn poll_once(&mut self, timeout: Duration) -> WebSocketResult<usize> {
        self.require(Role::Client, "poll_once")?;
        if self.hub.stop.is_stopped() {
            self.stop();
        }
        if self.state == EngineState::Stopped {
            return Ok(0);
        }
        Ok(self.turn(timeout))
    }

    /// Close every connection with 1001, then the listener.
    pub fn stop(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }

        for token in self.hub.registry.tokens() {
            self.hub.close_token(token, CloseCode::GoingAway, "");
        }
        self.flush_events();

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.state = EngineState::Stopped;
        self.hub.stop.stop();
        info!("WebSocket engine stopped");
    }

    fn require(&self, role: Role, op: &'static str) -> WebSocketResult<()> {
        if self.hub.role == role {
            Ok(())
        } else {
            Err(WebSocketError::WrongRole(op))
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn turn(&mut self, timeout: Duration) -> usize {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                self.wait_failed(&e);
            }
            return 0;
        }

        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for &token in &ready {
            if token == LISTENER {
                self.accept();
            } else {
                self.service(token);
            }
        }

        self.hub.expire_handshakes();
        self.flush_events();
        ready.len()
    }

    /// The readiness wait failed. Not fatal: raise `error` and keep going.
    fn wait_failed(&mut self, err: &io::Error) {
        self.hub.report("poll", None, err);
        self.flush_events();
    }

    fn accept(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            let (mut stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.hub.report("accept", None, &e);
                    self.flush_events();
                    return;
                },
            };

            if self.hub.registry.count() >= self.hub.config.max_clients {
                self.hub.reject(stream, addr);
                continue;
            }

            let token = self.next_token();
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                self.hub.report("register", None, &e);
                self.flush_events();
                continue;
            }

            let conn = Connection::new(stream, addr, token);
            debug!(conn = %conn.id(), addr = %addr, "Accepted connection");
            self.hub.admit(conn);
        }
    }

    fn service(&mut self, token: Token) {
        let Some(status) = self.hub.fill(token) else {
            self.flush_events();
            return;
        };

        if !self.hub.is_upgraded(token) {
            let step = self.hub.advance_handshake(token);
            self.flush_events();
            match step {
                HandshakeStep::Upgraded => {},
                HandshakeStep::Pending => {
                    if status.eof {
                        self.hub.close_token(token, CloseCode::Protocol, "");
                    }
                    return;
                },
                HandshakeStep::Closed => return,
            }
        }

        self.drain_frames(token);

        if status.eof && self.hub.close_token(token, CloseCode::Protocol, "") {
            debug!("Peer closed without a close frame");
            self.flush_events();
        }
    }

    fn drain_frames(&mut self, token: Token) {
        while let Some(frame) = self.hub.next_frame(token) {
            self.hub.handle_frame(token, frame);
            self.flush_events();
        }
        self.flush_events();
    }

    /// Dispatch queued events. Handler failures are logged and counted.
    fn flush_events(&mut self) {
        while let Some(event) = self.hub.pending.pop_front() {
            if let Err(e) = self.dispatcher.trigger(&mut self.hub, &event) {
                self.hub.stats.handler_error();
                let err = WebSocketError::Handler(e);
                warn!(event = %event.kind(), error = %err, "Event handler failed");
            }
        }
    }
}

/// Read a response head into `buf`, returning the head and leaving any
/// bytes that followed it in `buf`.
fn read_head(
    stream: &mut std::net::TcpStream,
    buf: &mut BytesMut,
    chunk: usize,
    max: usize,
) -> WebSocketResult<BytesMut> {
    let mut scratch = vec![0u8; chunk.max(1)];
    loop {
        if let Some(len) = head_len(&buf[..]) {
            return Ok(buf.split_to(len));
        }
        if buf.len() > max {
            return Err(WebSocketError::Handshake(format!(
                "response head exceeds {max} bytes"
            )));
        }
        match stream.read(&mut scratch) {
            Ok(0) => {
                return Err(WebSocketError::Handshake(
                    "connection closed during handshake".to_string(),
                ))
            },
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(WebSocketError::Handshake(
                    "timed out waiting for response".to_string(),
                ))
            },
            Err(e) => return Err(WebSocketError::transport("read", e)),
        }
    }
}

/// Send a masked 1002 close on a socket whose handshake failed.
fn abort_handshake(stream: &mut std::net::TcpStream) {
    let payload = close_payload(CloseCode::Protocol, REASON_HANDSHAKE);
    if let Ok(bytes) = frame::encode(&payload, OpCode::Close, true) {
        let _ = stream.write_all(&bytes);
    }
    let _ = stream.shutdown(Shutdown::Both);
}
