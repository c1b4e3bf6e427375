//! Session error types.

use che_rpc::ClientError;
use thiserror::Error;

/// Failures surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reconnection gave up; the session is `Failed` until `connect` is
    /// called again.
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Consecutive failed cycles.
        attempts: u32,
    },
    /// The session was closed while the operation was in progress.
    #[error("session closed")]
    Closed,
    /// A request sent on behalf of the session failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn exhausted_display() {
        let err = SessionError::ReconnectExhausted { attempts: 100 };
        assert_eq!(err.to_string(), "gave up after 100 reconnect attempts");
    }

    #[test]
    fn client_error_converts() {
        let err: SessionError = ClientError::ConnectionClosed.into();
        assert_matches!(err, SessionError::Client(ClientError::ConnectionClosed));
        assert_eq!(err.to_string(), "connection closed before a response arrived");
    }
}
