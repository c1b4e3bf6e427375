//! Scripted transport for tests.
//!
//! [`MockTransport`] records every connect URL and every sent message.
//! Events are emitted only when the test asks for them, synchronously on the
//! calling task, which plays the role of the socket task.
//!
//! Unlike [`WsTransport`](super::WsTransport), a scripted send failure is
//! delivered inside the `send` call itself. Tests built on the mock therefore
//! do not exercise the rule that events never arrive re-entrantly; that is
//! covered by the socket-level suite.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{EventKind, Listener, Listeners, Transport, TransportEvent};
use crate::error::TransportError;
use crate::registry::HandlerId;
use crate::types::{message_id, message_method};

/// In-memory [`Transport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    listeners: Listeners,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    connects: Vec<String>,
    sent: Vec<Value>,
    disconnects: usize,
    connected: bool,
    connect_failures: VecDeque<String>,
    send_failures: VecDeque<String>,
}

impl MockTransport {
    /// Fresh mock with no listeners and no history.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Scripting ────────────────────────────────────────────────────

    /// Make the next `connect` call fail with `reason`.
    ///
    /// The failure is returned only; emit `Error`/`Close` with
    /// [`Self::fail`] to drive listeners.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.inner.state.lock().connect_failures.push_back(reason.into());
    }

    /// Make the next `send` call fail with `reason`, reported as
    /// `SendFailed` for that message. The message is not recorded.
    pub fn fail_next_send(&self, reason: impl Into<String>) {
        self.inner.state.lock().send_failures.push_back(reason.into());
    }

    /// Deliver an arbitrary event.
    pub fn emit(&self, event: &TransportEvent) -> usize {
        self.inner.listeners.emit(event)
    }

    /// Deliver `Open`.
    pub fn open(&self) {
        self.inner.state.lock().connected = true;
        let _ = self.emit(&TransportEvent::Open);
    }

    /// Deliver `Close` as after a dropped connection (code 1006).
    pub fn close(&self) {
        self.inner.state.lock().connected = false;
        let _ = self.emit(&TransportEvent::Close {
            code: Some(1006),
            reason: "abnormal closure".into(),
        });
    }

    /// Deliver `Error` followed by `Close`, as a failed connect does.
    pub fn fail(&self, reason: &str) {
        self.inner.state.lock().connected = false;
        let _ = self.emit(&TransportEvent::Error(reason.to_owned()));
        let _ = self.emit(&TransportEvent::Close {
            code: None,
            reason: reason.to_owned(),
        });
    }

    /// Deliver an inbound message.
    pub fn receive(&self, message: Value) -> usize {
        self.emit(&TransportEvent::Response(message))
    }

    /// Answer request `id` with `result`.
    pub fn respond(&self, id: &str, result: Value) {
        let _ = self.receive(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    /// Answer request `id` with an error body.
    pub fn respond_error(&self, id: &str, number: i64, message: &str) {
        let _ = self.receive(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"number": number, "message": message},
        }));
    }

    /// Answer the most recent request for `method`. Returns its id.
    pub fn respond_to(&self, method: &str, result: Value) -> Option<String> {
        let id = self.last_request_id(method)?;
        self.respond(&id, result);
        Some(id)
    }

    /// Push a server notification.
    pub fn notify(&self, method: &str, params: Value) -> usize {
        self.receive(json!({"jsonrpc": "2.0", "method": method, "params": params}))
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// Every URL passed to `connect`, in order.
    pub fn connects(&self) -> Vec<String> {
        self.inner.state.lock().connects.clone()
    }

    /// Number of `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.inner.state.lock().connects.len()
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_count(&self) -> usize {
        self.inner.state.lock().disconnects
    }

    /// Every message passed to `send`, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.inner.state.lock().sent.clone()
    }

    /// Sent messages whose `method` is `method`.
    pub fn sent_with_method(&self, method: &str) -> Vec<Value> {
        self.inner
            .state
            .lock()
            .sent
            .iter()
            .filter(|m| message_method(m) == Some(method))
            .cloned()
            .collect()
    }

    /// Id of the most recent request for `method`.
    pub fn last_request_id(&self, method: &str) -> Option<String> {
        self.sent_with_method(method)
            .last()
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Forget recorded sends.
    pub fn clear_sent(&self) {
        self.inner.state.lock().sent.clear();
    }

    /// Listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.count(kind)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MockTransport")
            .field("connects", &state.connects.len())
            .field("sent", &state.sent.len())
            .field("connected", &state.connected)
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let (was_open, failure) = {
            let mut state = self.inner.state.lock();
            state.connects.push(url.to_owned());
            (std::mem::take(&mut state.connected), state.connect_failures.pop_front())
        };
        if was_open {
            let _ = self.emit(&TransportEvent::Reset);
        }
        match failure {
            Some(reason) => Err(TransportError::Connect {
                url: url.to_owned(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn disconnect(&self) {
        let was_open = {
            let mut state = self.inner.state.lock();
            state.disconnects += 1;
            std::mem::take(&mut state.connected)
        };
        if was_open {
            let _ = self.emit(&TransportEvent::Reset);
        }
    }

    fn send(&self, message: &Value) {
        let failure = {
            let mut state = self.inner.state.lock();
            let failure = state.send_failures.pop_front();
            if failure.is_none() {
                state.sent.push(message.clone());
            }
            failure
        };
        if let Some(reason) = failure {
            let _ = self.emit(&TransportEvent::SendFailed {
                id: message_id(message),
                reason,
            });
        }
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) -> HandlerId {
        self.inner.listeners.add(kind, listener)
    }

    fn remove_listener(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }
}
