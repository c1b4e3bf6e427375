//! # che-rpc
//!
//! JSON-RPC 2.0 over a WebSocket, in three layers:
//!
//! - [`transport`]: the socket. [`transport::WsTransport`] for real
//!   connections, [`transport::mock::MockTransport`] for tests. Both emit
//!   `Open`, `Close`, `Error` and `Response` events to registered listeners.
//! - [`client`]: request/response correlation by id, notification fan-out by
//!   method.
//! - [`router`]: subscribe/unsubscribe on top of the client, pairing a
//!   notification handler with the server-side subscription request.
//!
//! [`registry::HandlerRegistry`] and [`deferred`] are the small building
//! blocks the layers share.

#![deny(unsafe_code)]

pub mod client;
pub mod deferred;
pub mod error;
pub mod registry;
pub mod router;
pub mod transport;
pub mod types;

pub use client::{JsonRpcClient, NotificationHandler};
pub use deferred::{Deferred, DeferredFuture, deferred};
pub use error::{ClientError, TransportError};
pub use registry::{HandlerId, HandlerRegistry};
pub use router::PubSubRouter;
pub use transport::{EventKind, Listener, Transport, TransportEvent, WsTransport};
