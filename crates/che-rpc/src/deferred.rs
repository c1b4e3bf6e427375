//! Single-resolution futures.
//!
//! [`deferred`] returns a resolver and the future it settles. Resolving
//! consumes the resolver, so a second resolution cannot be written. If the
//! resolver is dropped unresolved the future yields [`Abandoned`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

/// The resolver was dropped without a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("deferred dropped without a value")]
pub struct Abandoned;

/// Write half: settles the paired [`DeferredFuture`] exactly once.
#[derive(Debug)]
pub struct Deferred<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Deferred<T> {
    /// Settle with `value`. Returns `false` if nobody is waiting any more.
    pub fn resolve(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Whether the waiting side has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read half: completes when the paired [`Deferred`] resolves.
#[derive(Debug)]
pub struct DeferredFuture<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for DeferredFuture<T> {
    type Output = Result<T, Abandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map_err(|_| Abandoned)
    }
}

/// Create a resolver/future pair.
pub fn deferred<T>() -> (Deferred<T>, DeferredFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (Deferred { tx }, DeferredFuture { rx })
}
