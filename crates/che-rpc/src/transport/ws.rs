//! `tokio-tungstenite` transport.
//!
//! Each successful [`WsTransport::connect`] spawns one socket task that owns
//! the stream: it writes queued frames, decodes inbound text frames and emits
//! events. Sockets are numbered; a socket that has been replaced or
//! disconnected emits a single `Reset` from the call that tore it down and
//! nothing further from its task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use che_settings::TransportSettings;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventKind, Listener, Listeners, Transport, TransportEvent};
use crate::error::TransportError;
use crate::registry::HandlerId;
use crate::types::message_id;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    settings: TransportSettings,
    listeners: Listeners,
    socket: Mutex<Option<Socket>>,
    generation: AtomicU64,
}

struct Socket {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl WsTransport {
    /// Transport with the given limits. No socket is opened yet.
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                listeners: Listeners::default(),
                socket: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.socket.lock().is_some()
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("connected", &self.is_connected())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit(&self, event: &TransportEvent) {
        let _ = self.listeners.emit(event);
    }

    /// Deliver `events` from a fresh task, dropping them if socket
    /// `generation` has been superseded meanwhile.
    fn emit_later(self: &Arc<Self>, events: Vec<TransportEvent>, generation: Option<u64>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(count = events.len(), "no runtime, dropping transport events");
            return;
        };
        let inner = Arc::clone(self);
        let _ = handle.spawn(async move {
            if generation.is_none_or(|g| inner.is_current(g)) {
                for event in &events {
                    inner.emit(event);
                }
            }
        });
    }

    /// Cancel the open socket, announcing `Reset` if there was one.
    fn reset_socket(&self) {
        let taken = self.socket.lock().take();
        if let Some(socket) = taken {
            socket.cancel.cancel();
            debug!(generation = socket.generation, "websocket torn down locally");
            self.emit(&TransportEvent::Reset);
        }
    }
}

/// The URL without its query string, which may carry a token.
pub(crate) fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.reset_socket();

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.inner.settings.max_message_size);

        debug!(url = redact(url), generation, "opening websocket");
        let ws = match connect_async_with_config(url, Some(config), false).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let reason = e.to_string();
                warn!(url = redact(url), error = %reason, "websocket connect failed");
                self.inner.emit_later(
                    vec![
                        TransportEvent::Error(reason.clone()),
                        TransportEvent::Close {
                            code: None,
                            reason: reason.clone(),
                        },
                    ],
                    Some(generation),
                );
                return Err(TransportError::Connect {
                    url: redact(url).to_owned(),
                    reason,
                });
            }
        };

        if !self.inner.is_current(generation) {
            debug!(generation, "handshake superseded, dropping socket");
            return Err(TransportError::Connect {
                url: redact(url).to_owned(),
                reason: "superseded by a newer connect or disconnect".into(),
            });
        }

        let (outbound, rx) = mpsc::channel(self.inner.settings.outbound_buffer.max(1));
        let cancel = CancellationToken::new();
        *self.inner.socket.lock() = Some(Socket {
            generation,
            outbound,
            cancel: cancel.clone(),
        });
        let _ = tokio::spawn(run_socket(Arc::clone(&self.inner), generation, ws, rx, cancel));
        Ok(())
    }

    fn disconnect(&self) {
        let _ = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.reset_socket();
    }

    fn send(&self, message: &Value) {
        let failure = match serde_json::to_string(message) {
            Err(e) => TransportError::Encode(e),
            Ok(text) => {
                let attempt = self
                    .inner
                    .socket
                    .lock()
                    .as_ref()
                    .map(|s| s.outbound.try_send(Message::Text(text.into())));
                match attempt {
                    Some(Ok(())) => return,
                    None | Some(Err(TrySendError::Closed(_))) => TransportError::NotConnected,
                    Some(Err(TrySendError::Full(_))) => TransportError::Backpressure {
                        capacity: self.inner.settings.outbound_buffer,
                    },
                }
            }
        };
        let id = message_id(message);
        warn!(error = %failure, id = ?id, "send failed");
        // Addressed to one message, so it stays valid whatever socket is
        // current when it is delivered.
        self.inner.emit_later(
            vec![TransportEvent::SendFailed {
                id,
                reason: failure.to_string(),
            }],
            None,
        );
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) -> HandlerId {
        self.inner.listeners.add(kind, listener)
    }

    fn remove_listener(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }
}

async fn run_socket(
    inner: Arc<Inner>,
    generation: u64,
    ws: WsStream,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = ws.split();
    inner.emit(&TransportEvent::Open);

    let (code, reason) = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = sink.close().await;
                    return;
                };
                if let Err(e) = sink.send(msg).await {
                    inner.emit(&TransportEvent::Error(e.to_string()));
                    break (None, e.to_string());
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => inner.emit(&TransportEvent::Response(value)),
                    Err(e) => warn!(error = %e, "dropping non-JSON frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or((None, String::new()), |f| {
                        (Some(u16::from(f.code)), (*f.reason).to_owned())
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    inner.emit(&TransportEvent::Error(e.to_string()));
                    break (None, e.to_string());
                }
                None => break (None, "stream ended".to_owned()),
            }
        }
    };

    {
        let mut slot = inner.socket.lock();
        if slot.as_ref().is_some_and(|s| s.generation == generation) {
            *slot = None;
        }
    }
    if inner.is_current(generation) {
        debug!(generation, ?code, %reason, "websocket closed");
        inner.emit(&TransportEvent::Close { code, reason });
    }
}
