//! # che-session
//!
//! Keeps one logical connection per entrypoint alive across network blips
//! and exposes the server's event channels as typed subscriptions.
//!
//! - [`manager::SessionManager`]: connection state machine, reconnection
//!   policy, liveness probing, reference-counted subscriptions
//! - [`registry::ConnectionRegistry`]: one session per entrypoint
//! - [`status::StatusWaiter`]: wait for a workspace to reach a status
//! - [`channels`] and [`events`]: the channel catalogue and its payloads

#![deny(unsafe_code)]

pub mod channels;
pub mod error;
pub mod events;
pub mod liveness;
pub mod manager;
pub mod registry;
pub mod status;
pub mod url;

pub use channels::Channel;
pub use error::SessionError;
pub use events::{UnknownStatus, WorkspaceStatus};
pub use manager::{ConnectionState, SessionManager, Subscription};
pub use registry::{ConnectionRegistry, TransportFactory, WsTransportFactory};
pub use status::StatusWaiter;
pub use url::{StaticToken, TokenProvider, connection_url};
