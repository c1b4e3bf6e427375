//! Client-id fetch and the periodic liveness probe.

use std::future::Future;
use std::time::Duration;

use che_core::constants::CLIENT_ID_METHOD;
use che_core::ids::ClientId;
use che_rpc::{ClientError, JsonRpcClient};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why a client-id fetch did not produce an id.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No answer within the allowed time.
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    /// The request failed.
    #[error(transparent)]
    Rpc(#[from] ClientError),
    /// The answer did not contain an id.
    #[error("unexpected client id result: {0}")]
    Malformed(Value),
}

/// Ask the server for this connection's client id.
///
/// The request is dropped when `timeout` elapses first, so a late answer
/// settles nothing.
pub async fn fetch_client_id(client: &JsonRpcClient, timeout: Duration) -> Result<ClientId, ProbeError> {
    let result = time::timeout(timeout, client.request(CLIENT_ID_METHOD, None))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;
    parse_client_id(result)
}

/// `["<id>"]`, or a bare string.
fn parse_client_id(result: Value) -> Result<ClientId, ProbeError> {
    let id = match &result {
        Value::Array(items) => items.first().and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    };
    match id {
        Some(id) if !id.is_empty() => Ok(ClientId::from(id)),
        _ => Err(ProbeError::Malformed(result)),
    }
}

/// Outcome of the liveness loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessResult {
    /// A probe failed.
    Dead {
        /// What went wrong.
        reason: String,
    },
    /// The loop was cancelled externally.
    Cancelled,
}

/// Run `probe` every `interval` until one fails or `cancel` fires.
///
/// The first probe runs one interval after the call. Cancellation also
/// interrupts a probe in flight.
pub async fn run_liveness<F, Fut>(interval: Duration, cancel: CancellationToken, mut probe: F) -> LivenessResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ProbeError>>,
{
    let mut ticks = time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            () = cancel.cancelled() => return LivenessResult::Cancelled,
        }
        tokio::select! {
            outcome = probe() => {
                if let Err(e) = outcome {
                    return LivenessResult::Dead { reason: e.to_string() };
                }
            }
            () = cancel.cancelled() => return LivenessResult::Cancelled,
        }
    }
}
