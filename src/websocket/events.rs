//! Named event subscriptions.
//!
//! Application code subscribes to engine events by name. Handlers receive a
//! mutable context (the engine's [`Hub`](crate::websocket::Hub)) so they can
//! reply, broadcast or disconnect from inside the callback.

use crate::websocket::connection::Peer;
use crate::websocket::error::{HandlerError, WebSocketError, WebSocketResult};
use crate::websocket::frame::CloseCode;
use bytes::Bytes;
use std::io;
use std::str::FromStr;

/// Result returned by event handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Event names understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A peer completed the handshake.
    Connect,
    /// A text message arrived.
    Receive,
    /// A ping arrived.
    Ping,
    /// A pong arrived.
    Pong,
    /// A text message was written to a peer.
    Send,
    /// A peer was disconnected.
    Disconnect,
    /// A socket call failed.
    Error,
}

impl EventKind {
    /// The event's subscription name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Receive => "receive",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Send => "send",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventKind {
    type Err = WebSocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Self::Connect),
            "receive" => Ok(Self::Receive),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "send" => Ok(Self::Send),
            "disconnect" => Ok(Self::Disconnect),
            "error" => Ok(Self::Error),
            "" => Err(WebSocketError::InvalidSubscription(
                "empty event name".to_string(),
            )),
            other => Err(WebSocketError::InvalidSubscription(format!(
                "unknown event '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Details of a failed socket call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportErrorInfo {
    /// The operation that failed.
    pub op: &'static str,
    /// Error kind.
    pub kind: io::ErrorKind,
    /// OS error code, when there is one.
    pub code: Option<i32>,
    /// Error message.
    pub message: String,
}

impl TransportErrorInfo {
    /// Capture an I/O error.
    pub fn new(op: &'static str, err: &io::Error) -> Self {
        Self {
            op,
            kind: err.kind(),
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// An engine event and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer completed the handshake.
    Connect {
        /// The peer.
        peer: Peer,
    },
    /// A text message arrived.
    Receive {
        /// The sender.
        peer: Peer,
        /// Message text.
        payload: String,
    },
    /// A ping arrived; the engine has already answered it.
    Ping {
        /// The sender.
        peer: Peer,
        /// Ping payload.
        payload: Bytes,
    },
    /// A pong arrived.
    Pong {
        /// The sender.
        peer: Peer,
        /// Pong payload.
        payload: Bytes,
    },
    /// A text message was written.
    Send {
        /// The recipient.
        peer: Peer,
        /// Message text.
        payload: String,
    },
    /// A peer was disconnected and removed.
    Disconnect {
        /// The peer.
        peer: Peer,
        /// Close status.
        code: CloseCode,
        /// Close reason.
        reason: String,
    },
    /// A socket call failed.
    Error {
        /// The affected peer, if it could be resolved.
        peer: Option<Peer>,
        /// Failure details.
        info: TransportErrorInfo,
    },
}

impl Event {
    /// The kind used to match subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect { .. } => EventKind::Connect,
            Self::Receive { .. } => EventKind::Receive,
            Self::Ping { .. } => EventKind::Ping,
            Self::Pong { .. } => EventKind::Pong,
            Self::Send { .. } => EventKind::Send,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// The peer the event concerns.
    pub fn peer(&self) -> Option<&Peer> {
        match self {
            Self::Connect { peer }
            | Self::Receive { peer, .. }
            | Self::Ping { peer, .. }
            | Self::Pong { peer, .. }
            | Self::Send { peer, .. }
            | Self::Disconnect { peer, .. } => Some(peer),
            Self::Error { peer, .. } => peer.as_ref(),
        }
    }
}

type Handler<C> = Box<dyn FnMut(&mut C, &Event) -> HandlerResult + Send>;

struct Subscription<C> {
    kind: EventKind,
    once: bool,
    handler: Handler<C>,
}

/// Ordered subscription list.
pub struct Dispatcher<C> {
    subscriptions: Vec<Subscription<C>>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }
}

impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl<C> Dispatcher<C> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to every `name` event.
    pub fn on<F>(&mut self, name: &str, handler: F) -> WebSocketResult<()>
    where
        F: FnMut(&mut C, &Event) -> HandlerResult + Send + 'static,
    {
        self.subscribe(name, false, Box::new(handler))
    }

    /// Subscribe `handler` to the next `name` event only.
    pub fn once<F>(&mut self, name: &str, handler: F) -> WebSocketResult<()>
    where
        F: FnMut(&mut C, &Event) -> HandlerResult + Send + 'static,
    {
        self.subscribe(name, true, Box::new(handler))
    }

    fn subscribe(&mut self, name: &str, once: bool, handler: Handler<C>) -> WebSocketResult<()> {
        let kind = name.parse::<EventKind>()?;
        self.subscriptions.push(Subscription {
            kind,
            once,
            handler,
        });
        Ok(())
    }

    /// Number of subscriptions for `kind`.
    pub fn subscribers(&self, kind: EventKind) -> usize {
        self.subscriptions.iter().filter(|s| s.kind == kind).count()
    }

    /// Invoke every handler subscribed to the event, in registration order.
    ///
    /// One-shot handlers are dropped before their result is inspected. The
    /// first handler error stops dispatch and is returned.
    pub fn trigger(&mut self, ctx: &mut C, event: &Event) -> Result<usize, HandlerError> {
        let kind = event.kind();
        let mut invoked = 0;
        let mut i = 0;

        while i < self.subscriptions.len() {
            if self.subscriptions[i].kind != kind {
                i += 1;
                continue;
            }

            invoked += 1;
            let result = if self.subscriptions[i].once {
                let mut sub = self.subscriptions.remove(i);
                (sub.handler)(ctx, event)
            } else {
                let result = (self.subscriptions[i].handler)(ctx, event);
                i += 1;
                result
            };
            result?;
        }

        Ok(invoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionId;

    fn peer() -> Peer {
        Peer {
            id: ConnectionId::next(),
            addr: "127.0.0.1:9".parse().unwrap(),
            path: "/".to_string(),
        }
    }

    fn connect_event() -> Event {
        Event::Connect { peer: peer() }
    }

    #[test]
    fn test_event_kind_names() {
        for kind in [
            EventKind::Connect,
            EventKind::Receive,
            EventKind::Ping,
            EventKind::Pong,
            EventKind::Send,
            EventKind::Disconnect,
            EventKind::Error,
        ] {
            assert_eq!(kind.name().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_invalid_subscription() {
        let mut dispatcher: Dispatcher<Vec<&'static str>> = Dispatcher::new();
        assert!(matches!(
            dispatcher.on("", |_, _| Ok(())),
            Err(WebSocketError::InvalidSubscription(_))
        ));
        assert!(matches!(
            dispatcher.once("message", |_, _| Ok(())),
            Err(WebSocketError::InvalidSubscription(_))
        ));
        assert_eq!(dispatcher.subscribers(EventKind::Connect), 0);
    }

    #[test]
    fn test_trigger_in_registration_order() {
        let mut dispatcher: Dispatcher<Vec<&'static str>> = Dispatcher::new();
        dispatcher
            .on("connect", |log, _| {
                log.push("first");
                Ok(())
            })
            .unwrap();
        dispatcher
            .on("disconnect", |log, _| {
                log.push("other");
                Ok(())
            })
            .unwrap();
        dispatcher
            .on("connect", |log, _| {
                log.push("second");
                Ok(())
            })
            .unwrap();

        let mut log = Vec::new();
        let invoked = dispatcher.trigger(&mut log, &connect_event()).unwrap();
        assert_eq!(invoked, 2);
        assert_eq!(log, vec!["first", "second"]);
    }

    #[test]
    fn test_once_fires_once() {
        let mut dispatcher: Dispatcher<u32> = Dispatcher::new();
        dispatcher
            .once("connect", |count, _| {
                *count += 1;
                Ok(())
            })
            .unwrap();
        dispatcher
            .on("connect", |count, _| {
                *count += 10;
                Ok(())
            })
            .unwrap();

        let mut count = 0;
        let event = connect_event();
        dispatcher.trigger(&mut count, &event).unwrap();
        dispatcher.trigger(&mut count, &event).unwrap();
        assert_eq!(count, 21);
        assert_eq!(dispatcher.subscribers(EventKind::Connect), 1);
    }

    #[test]
    fn test_once_removed_even_on_error() {
        let mut dispatcher: Dispatcher<u32> = Dispatcher::new();
        dispatcher
            .once("connect", |count, _| {
                *count += 1;
                Err("boom".into())
            })
            .unwrap();
        dispatcher
            .on("connect", |count, _| {
                *count += 10;
                Ok(())
            })
            .unwrap();

        let mut count = 0;
        let event = connect_event();
        assert!(dispatcher.trigger(&mut count, &event).is_err());
        assert_eq!(count, 1);
        assert_eq!(dispatcher.subscribers(EventKind::Connect), 1);

        dispatcher.trigger(&mut count, &event).unwrap();
        assert_eq!(count, 11);
    }

    #[test]
    fn test_event_accessors() {
        let p = peer();
        let event = Event::Disconnect {
            peer: p.clone(),
            code: CloseCode::Normal,
            reason: "bye".to_string(),
        };
        assert_eq!(event.kind(), EventKind::Disconnect);
        assert_eq!(event.peer(), Some(&p));

        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let event = Event::Error {
            peer: None,
            info: TransportErrorInfo::new("write", &err),
        };
        assert_eq!(event.kind(), EventKind::Error);
        assert!(event.peer().is_none());
    }
}
