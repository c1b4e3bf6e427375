//! Error types for the transport and the protocol client.

use che_core::errors::RpcErrorPayload;
use thiserror::Error;

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The WebSocket handshake failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// URL that was dialed.
        url: String,
        /// Underlying cause.
        reason: String,
    },
    /// No socket is open.
    #[error("transport is not connected")]
    NotConnected,
    /// The outbound queue is full.
    #[error("outbound buffer full ({capacity} frames)")]
    Backpressure {
        /// Configured queue length.
        capacity: usize,
    },
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of a JSON-RPC request.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error response.
    #[error("rpc error {0}")]
    Rpc(#[from] RpcErrorPayload),
    /// The socket closed while the request was outstanding.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    /// The transport could not write the request.
    #[error("request could not be sent: {0}")]
    NotSent(String),
    /// The transport refused the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// The server's error payload, if this is a protocol error.
    pub fn rpc_payload(&self) -> Option<&RpcErrorPayload> {
        match self {
            Self::Rpc(p) => Some(p),
            _ => None,
        }
    }
}
