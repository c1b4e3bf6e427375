//! Channel subscriptions over JSON-RPC.
//!
//! A subscription is a notification handler plus a server-side subscribe
//! request. [`PubSubRouter::subscribe`] registers the handler before the
//! request goes out so no event racing the acknowledgement is lost, and
//! removes it again if the request fails or is abandoned.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::client::{JsonRpcClient, NotificationHandler};
use crate::error::{ClientError, TransportError};
use crate::registry::HandlerId;
use crate::transport::Transport;

/// Facade pairing notification handlers with subscribe/unsubscribe requests.
#[derive(Debug)]
pub struct PubSubRouter {
    client: JsonRpcClient,
}

impl PubSubRouter {
    /// Router over a fresh [`JsonRpcClient`] on `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            client: JsonRpcClient::new(transport),
        }
    }

    /// The protocol client.
    pub fn client(&self) -> &JsonRpcClient {
        &self.client
    }

    /// Open the transport to `entrypoint`.
    pub async fn connect(&self, entrypoint: &str) -> Result<(), TransportError> {
        self.client.transport().connect(entrypoint).await
    }

    /// Close the transport.
    pub fn disconnect(&self) {
        self.client.transport().disconnect();
    }

    /// Plain request passthrough.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.client.request(method, params).await
    }

    /// Register `callback` for `notify_method`, then send `subscribe_method`.
    ///
    /// Returns the handler id needed to unsubscribe.
    #[instrument(skip(self, callback, params))]
    pub async fn subscribe(
        &self,
        subscribe_method: &str,
        notify_method: &str,
        callback: NotificationHandler,
        params: Option<Value>,
    ) -> Result<HandlerId, ClientError> {
        let id = self.client.add_notification_handler(notify_method, callback);
        let rollback = Rollback {
            client: &self.client,
            method: notify_method,
            id: Some(id),
        };

        match self.client.request(subscribe_method, params).await {
            Ok(_) => {
                rollback.disarm();
                Ok(id)
            }
            Err(e) => {
                debug!(error = %e, "subscribe request failed, handler removed");
                Err(e)
            }
        }
    }

    /// Remove handler `id` from `notify_method`, then send `unsubscribe_method`.
    ///
    /// The handler is gone even if the request fails.
    #[instrument(skip(self, params))]
    pub async fn unsubscribe(
        &self,
        unsubscribe_method: &str,
        notify_method: &str,
        id: HandlerId,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        if !self.client.remove_notification_handler(notify_method, id) {
            debug!(%id, "handler was not registered");
        }
        let _ = self.client.request(unsubscribe_method, params).await?;
        Ok(())
    }
}

/// Removes a freshly added handler unless disarmed.
struct Rollback<'a> {
    client: &'a JsonRpcClient,
    method: &'a str,
    id: Option<HandlerId>,
}

impl Rollback<'_> {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let _ = self.client.remove_notification_handler(self.method, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (MockTransport, Arc<PubSubRouter>) {
        let mock = MockTransport::new();
        let router = Arc::new(PubSubRouter::new(Arc::new(mock.clone())));
        (mock, router)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn collector(log: &Arc<Mutex<Vec<Value>>>) -> NotificationHandler {
        let log = Arc::clone(log);
        Arc::new(move |params: &Value| log.lock().push(params.clone()))
    }

    #[tokio::test]
    async fn connect_passes_entrypoint_through() {
        let (mock, router) = setup();
        router.connect("wss://example/api").await.unwrap();
        router.disconnect();
        assert_eq!(mock.connects(), vec!["wss://example/api"]);
        assert_eq!(mock.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_registers_then_requests() {
        let (mock, router) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let params = json!({"method": "workspace/statusChanged", "scope": {"workspaceId": "w1"}});

        let task = {
            let router = Arc::clone(&router);
            let handler = collector(&log);
            let params = params.clone();
            tokio::spawn(async move {
                router
                    .subscribe("subscribe", "workspace/statusChanged", handler, Some(params))
                    .await
            })
        };
        settle().await;

        // An event racing the acknowledgement is delivered.
        let _ = mock.notify("workspace/statusChanged", json!({"status": "STARTING"}));
        let sent = mock.sent_with_method("subscribe");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["params"], params);

        let _ = mock.respond_to("subscribe", Value::Null);
        let id = task.await.unwrap().unwrap();
        let _ = mock.notify("workspace/statusChanged", json!({"status": "RUNNING"}));

        assert_eq!(log.lock().len(), 2);
        assert_eq!(router.client().notification_handler_count("workspace/statusChanged"), 1);

        let unsub = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router
                    .unsubscribe("unsubscribe", "workspace/statusChanged", id, None)
                    .await
            })
        };
        settle().await;
        assert_eq!(router.client().notification_handler_count("workspace/statusChanged"), 0);
        let _ = mock.respond_to("unsubscribe", Value::Null);
        unsub.await.unwrap().unwrap();

        let _ = mock.notify("workspace/statusChanged", json!({"status": "STOPPED"}));
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn failed_subscribe_rolls_back_handler() {
        let (mock, router) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let router = Arc::clone(&router);
            let handler = collector(&log);
            tokio::spawn(async move { router.subscribe("subscribe", "m", handler, None).await })
        };
        settle().await;
        let id = mock.last_request_id("subscribe").unwrap();
        mock.respond_error(&id, 500, "nope");

        assert_matches!(task.await.unwrap(), Err(ClientError::Rpc(_)));
        assert_eq!(router.client().notification_handler_count("m"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_subscribe_rolls_back_handler() {
        let (_mock, router) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let outcome = tokio::time::timeout(
            Duration::from_millis(5),
            router.subscribe("subscribe", "m", collector(&log), None),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(router.client().notification_handler_count("m"), 0);
        assert_eq!(router.client().pending_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_handlers() {
        let (mock, router) = setup();
        let a_log = Arc::new(Mutex::new(Vec::new()));
        let b_log = Arc::new(Mutex::new(Vec::new()));
        let a = router.client().add_notification_handler("m", collector(&a_log));
        let _b = router.client().add_notification_handler("m", collector(&b_log));

        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.unsubscribe("unsubscribe", "m", a, None).await })
        };
        settle().await;
        let _ = mock.respond_to("unsubscribe", json!(true));
        task.await.unwrap().unwrap();

        let _ = mock.notify("m", json!(1));
        assert!(a_log.lock().is_empty());
        assert_eq!(b_log.lock().len(), 1);
    }
}
