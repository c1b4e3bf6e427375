//! The socket seam.
//!
//! A [`Transport`] opens one WebSocket at a time and reports what happens to
//! it through listener callbacks. Callbacks run on the transport's own task,
//! never inside the call that caused them, so a listener may call back into
//! the transport. The exception is [`TransportEvent::Reset`], delivered
//! before the `connect`/`disconnect` call that caused it returns; its
//! listeners must not call back into the transport.

pub mod mock;
mod ws;

pub use ws::WsTransport;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::registry::{HandlerId, HandlerRegistry};

/// Kinds of events a listener can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The socket opened.
    Open,
    /// The socket closed or could not be opened.
    Close,
    /// A connect, read or write failed.
    Error,
    /// A text frame arrived and decoded as JSON.
    Response,
    /// The open socket was torn down locally.
    Reset,
}

/// An event delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The socket opened.
    Open,
    /// The socket closed. `code` is absent when no close frame was received.
    Close {
        /// WebSocket close code.
        code: Option<u16>,
        /// Close reason or failure description.
        reason: String,
    },
    /// A failure, described for logging.
    Error(String),
    /// A message could not be written. Only that message is affected.
    SendFailed {
        /// The JSON-RPC id of the message, if it had one.
        id: Option<String>,
        /// Failure description.
        reason: String,
    },
    /// A decoded inbound message.
    Response(Value),
    /// `disconnect` or a replacing `connect` tore down the open socket. No
    /// `Close` follows for it; anything in flight on it is lost.
    Reset,
}

impl TransportEvent {
    /// The listener kind this event is delivered to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close { .. } => EventKind::Close,
            Self::Error(_) | Self::SendFailed { .. } => EventKind::Error,
            Self::Response(_) => EventKind::Response,
            Self::Reset => EventKind::Reset,
        }
    }
}

/// A listener callback.
pub type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// A WebSocket carrying JSON messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`, replacing any open one.
    ///
    /// Resolves once the handshake completes. A failure is returned here and
    /// is also reported as an `Error` event followed by a `Close` event.
    /// Replacing an open socket emits `Reset` before the handshake starts.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Close the socket. Idempotent; emits `Reset` instead of `Close` when a
    /// socket was open.
    fn disconnect(&self);

    /// Queue one message. A failure is reported as a `SendFailed` event
    /// naming the message's id.
    fn send(&self, message: &Value);

    /// Register a listener for `kind`.
    fn add_listener(&self, kind: EventKind, listener: Listener) -> HandlerId;

    /// Remove a listener. Returns whether it was registered.
    fn remove_listener(&self, kind: EventKind, id: HandlerId) -> bool;
}

/// Listener bookkeeping shared by the implementations.
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    registry: HandlerRegistry<EventKind, TransportEvent>,
}

impl Listeners {
    pub(crate) fn add(&self, kind: EventKind, listener: Listener) -> HandlerId {
        self.registry.add(kind, listener)
    }

    pub(crate) fn remove(&self, kind: EventKind, id: HandlerId) -> bool {
        self.registry.remove(&kind, id)
    }

    pub(crate) fn emit(&self, event: &TransportEvent) -> usize {
        self.registry.dispatch(&event.kind(), event)
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.registry.count(&kind)
    }
}
