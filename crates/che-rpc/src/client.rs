//! JSON-RPC 2.0 request correlation and notification fan-out.
//!
//! Every inbound message is either a response or a notification, never
//! both: a message whose `id` names an outstanding request settles that
//! request; anything else with a `method` goes to the handlers registered
//! for that method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use che_core::errors::RpcErrorPayload;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::deferred::{Deferred, deferred};
use crate::error::{ClientError, TransportError};
use crate::registry::{HandlerId, HandlerRegistry};
use crate::transport::{EventKind, Listener, Transport, TransportEvent};
use crate::types::{Notification, Outcome, Request, message_id, message_method, outcome};

/// Callback for a notification method. Receives `params` (`null` if absent).
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

type PendingMap = Mutex<HashMap<String, Deferred<Result<Value, ClientError>>>>;

static NULL: Value = Value::Null;

/// JSON-RPC client bound to one transport.
///
/// Dropping the client detaches it from the transport.
pub struct JsonRpcClient {
    inner: Arc<ClientInner>,
    listeners: Vec<(EventKind, HandlerId)>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: PendingMap,
    notifications: HandlerRegistry<String, Value>,
}

impl JsonRpcClient {
    /// Attach a client to `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(ClientInner {
            transport: Arc::clone(&transport),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            notifications: HandlerRegistry::new(),
        });

        let on_message: Listener = {
            let weak: Weak<ClientInner> = Arc::downgrade(&inner);
            Arc::new(move |event: &TransportEvent| {
                if let (Some(inner), TransportEvent::Response(message)) = (weak.upgrade(), event) {
                    inner.dispatch(message);
                }
            })
        };
        let on_lost: Listener = {
            let weak: Weak<ClientInner> = Arc::downgrade(&inner);
            Arc::new(move |_: &TransportEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.fail_pending();
                }
            })
        };
        let on_error: Listener = {
            let weak: Weak<ClientInner> = Arc::downgrade(&inner);
            Arc::new(move |event: &TransportEvent| {
                let TransportEvent::SendFailed { id: Some(id), reason } = event else {
                    return;
                };
                if let Some(inner) = weak.upgrade() {
                    inner.fail_one(id, reason);
                }
            })
        };

        let listeners = vec![
            (
                EventKind::Response,
                transport.add_listener(EventKind::Response, on_message),
            ),
            (
                EventKind::Close,
                transport.add_listener(EventKind::Close, Arc::clone(&on_lost)),
            ),
            (
                EventKind::Reset,
                transport.add_listener(EventKind::Reset, on_lost),
            ),
            (
                EventKind::Error,
                transport.add_listener(EventKind::Error, on_error),
            ),
        ];

        Self { inner, listeners }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Send a request and wait for its response.
    ///
    /// Dropping the returned future forgets the request; a response that
    /// arrives afterwards is ignored.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (resolver, settled) = deferred();
        let _ = self.inner.pending.lock().insert(id.clone(), resolver);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: &id,
        };

        let frame = serde_json::to_value(Request::new(&id, method, params.as_ref()))
            .map_err(TransportError::Encode)?;
        trace!(%id, method, "sending request");
        self.inner.transport.send(&frame);

        settled.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Send a notification. No id is allocated and nothing is awaited.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        match serde_json::to_value(Notification::new(method, params.as_ref())) {
            Ok(frame) => self.inner.transport.send(&frame),
            Err(e) => debug!(method, error = %e, "failed to encode notification"),
        }
    }

    /// Register `handler` for notifications named `method`.
    pub fn add_notification_handler(
        &self,
        method: impl Into<String>,
        handler: NotificationHandler,
    ) -> HandlerId {
        self.inner.notifications.add(method.into(), handler)
    }

    /// Remove one registration. Returns whether it existed.
    pub fn remove_notification_handler(&self, method: &str, id: HandlerId) -> bool {
        self.inner.notifications.remove(method, id)
    }

    /// Handlers registered for `method`.
    pub fn notification_handler_count(&self, method: &str) -> usize {
        self.inner.notifications.count(method)
    }

    /// Drop every notification handler.
    pub fn clear_notification_handlers(&self) {
        self.inner.notifications.clear();
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        for (kind, id) in self.listeners.drain(..) {
            let _ = self.inner.transport.remove_listener(kind, id);
        }
    }
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("pending", &self.pending_count())
            .field("notifications", &self.inner.notifications)
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn dispatch(&self, message: &Value) {
        if let Value::Array(batch) = message {
            for item in batch {
                self.dispatch(item);
            }
            return;
        }

        if let Some(id) = message_id(message) {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                let settled = match outcome(message) {
                    Outcome::Result(result) => Ok(result.clone()),
                    Outcome::Error(error) => Err(ClientError::Rpc(RpcErrorPayload::from_wire(error))),
                    Outcome::Empty => {
                        debug!(%id, "response has neither result nor error, ignoring");
                        return;
                    }
                };
                let resolver = pending.remove(&id);
                drop(pending);
                if let Some(resolver) = resolver {
                    let _ = resolver.resolve(settled);
                }
                return;
            }
        }

        match message_method(message) {
            Some(method) => {
                let params = message.get("params").unwrap_or(&NULL);
                if self.notifications.dispatch(method, params) == 0 {
                    trace!(method, "no handler for notification");
                }
            }
            None => debug!(id = ?message.get("id"), "response for unknown request, ignoring"),
        }
    }

    /// Reject request `id` only; the socket itself may still be healthy.
    fn fail_one(&self, id: &str, reason: &str) {
        let resolver = self.pending.lock().remove(id);
        if let Some(resolver) = resolver {
            debug!(%id, %reason, "request could not be sent");
            let _ = resolver.resolve(Err(ClientError::NotSent(reason.to_owned())));
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "connection lost, failing outstanding requests");
        for (_, resolver) in drained {
            let _ = resolver.resolve(Err(ClientError::ConnectionClosed));
        }
    }
}

/// Removes a request's pending entry when its future completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.pending.lock().remove(self.id);
    }
}
