//! Waiting for a workspace to reach a status.
//!
//! Register interest with [`StatusWaiter::wait_for`] before triggering the
//! transition, then await the returned future. Every waiter for the same
//! `(workspace, status)` pair resolves on the same event and is forgotten.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use che_core::ids::WorkspaceId;
use che_rpc::{Deferred, DeferredFuture, deferred};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::SessionError;
use crate::events::{WorkspaceStatus, WorkspaceStatusEvent};
use crate::manager::{SessionManager, Subscription};

type Waiters = HashMap<(WorkspaceId, WorkspaceStatus), Vec<Deferred<Option<WorkspaceStatusEvent>>>>;

/// Tracks workspace statuses and resolves waiters on transitions.
#[derive(Clone)]
pub struct StatusWaiter {
    session: SessionManager,
    inner: Arc<WaiterInner>,
}

#[derive(Default)]
struct WaiterInner {
    known: Mutex<HashMap<WorkspaceId, WorkspaceStatus>>,
    waiters: Mutex<Waiters>,
    tracked: Mutex<HashMap<WorkspaceId, Subscription>>,
}

impl WaiterInner {
    fn handle(&self, event: &WorkspaceStatusEvent) {
        let Some(status) = event.effective_status() else {
            debug!(workspace = %event.workspace_id, "status event without status");
            return;
        };
        let _ = self.known.lock().insert(event.workspace_id.clone(), status);
        let ready = self
            .waiters
            .lock()
            .remove(&(event.workspace_id.clone(), status))
            .unwrap_or_default();
        for waiter in ready {
            let _ = waiter.resolve(Some(event.clone()));
        }
    }
}

impl StatusWaiter {
    /// Waiter fed by `session`'s workspace status channel.
    pub fn new(session: SessionManager) -> Self {
        Self {
            session,
            inner: Arc::new(WaiterInner::default()),
        }
    }

    /// Subscribe to status events of `workspace_id`. Idempotent.
    pub async fn track(&self, workspace_id: &WorkspaceId) -> Result<(), SessionError> {
        if self.inner.tracked.lock().contains_key(workspace_id) {
            return Ok(());
        }
        let weak: Weak<WaiterInner> = Arc::downgrade(&self.inner);
        let subscription = self
            .session
            .subscribe_workspace_status(workspace_id, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle(event);
                }
            })
            .await?;

        let duplicate = self
            .inner
            .tracked
            .lock()
            .insert(workspace_id.clone(), subscription);
        if let Some(extra) = duplicate {
            self.session.unsubscribe(extra).await?;
        }
        Ok(())
    }

    /// Stop tracking `workspace_id`. Outstanding waiters for it are abandoned.
    pub async fn untrack(&self, workspace_id: &WorkspaceId) -> Result<(), SessionError> {
        let subscription = self.inner.tracked.lock().remove(workspace_id);
        self.inner.waiters.lock().retain(|(ws, _), _| ws != workspace_id);
        let _ = self.inner.known.lock().remove(workspace_id);
        match subscription {
            Some(subscription) => self.session.unsubscribe(subscription).await,
            None => Ok(()),
        }
    }

    /// Whether `workspace_id` is tracked.
    pub fn is_tracked(&self, workspace_id: &WorkspaceId) -> bool {
        self.inner.tracked.lock().contains_key(workspace_id)
    }

    /// Seed the last known status, e.g. from a REST lookup.
    pub fn set_known(&self, workspace_id: &WorkspaceId, status: WorkspaceStatus) {
        let _ = self.inner.known.lock().insert(workspace_id.clone(), status);
    }

    /// Last status seen for `workspace_id`.
    pub fn known_status(&self, workspace_id: &WorkspaceId) -> Option<WorkspaceStatus> {
        self.inner.known.lock().get(workspace_id).copied()
    }

    /// Future resolving the next time `workspace_id` reaches `status`.
    ///
    /// Resolves at once with `None` when the workspace is already known to
    /// be there; otherwise with the event that got it there.
    pub fn wait_for(
        &self,
        workspace_id: &WorkspaceId,
        status: WorkspaceStatus,
    ) -> DeferredFuture<Option<WorkspaceStatusEvent>> {
        let (resolver, settled) = deferred();
        if self.known_status(workspace_id) == Some(status) {
            let _ = resolver.resolve(None);
        } else {
            self.inner
                .waiters
                .lock()
                .entry((workspace_id.clone(), status))
                .or_default()
                .push(resolver);
        }
        settled
    }

    /// Apply a status event as if it had arrived on the channel.
    pub fn handle(&self, event: &WorkspaceStatusEvent) {
        self.inner.handle(event);
    }

    /// Waiters not yet resolved.
    pub fn pending(&self) -> usize {
        self.inner.waiters.lock().values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for StatusWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWaiter")
            .field("tracked", &self.inner.tracked.lock().len())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use che_core::constants::{CLIENT_ID_METHOD, SUBSCRIBE_METHOD};
    use che_rpc::transport::mock::MockTransport;
    use che_settings::SessionSettings;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn waiter() -> (MockTransport, SessionManager, StatusWaiter) {
        let mock = MockTransport::new();
        let session = SessionManager::new(
            "ws://localhost/api",
            Arc::new(mock.clone()),
            SessionSettings::default(),
            None,
        );
        let waiter = StatusWaiter::new(session.clone());
        (mock, session, waiter)
    }

    fn event(workspace: &str, status: &str) -> WorkspaceStatusEvent {
        serde_json::from_value(json!({"workspaceId": workspace, "status": status})).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn resolves_all_waiters_for_pair() {
        let (_mock, _session, waiter) = waiter();
        let w1 = WorkspaceId::from("w1");
        let a = waiter.wait_for(&w1, WorkspaceStatus::Running);
        let b = waiter.wait_for(&w1, WorkspaceStatus::Running);
        let stopped = waiter.wait_for(&w1, WorkspaceStatus::Stopped);
        assert_eq!(waiter.pending(), 3);

        waiter.handle(&event("w1", "RUNNING"));
        assert_eq!(a.await.unwrap().unwrap().status, Some(WorkspaceStatus::Running));
        assert!(b.await.unwrap().is_some());
        assert_eq!(waiter.pending(), 1);
        assert_eq!(waiter.known_status(&w1), Some(WorkspaceStatus::Running));
        drop(stopped);
    }

    #[tokio::test]
    async fn already_in_status_resolves_immediately() {
        let (_mock, _session, waiter) = waiter();
        let w1 = WorkspaceId::from("w1");
        waiter.set_known(&w1, WorkspaceStatus::Stopped);
        assert_eq!(waiter.wait_for(&w1, WorkspaceStatus::Stopped).await.unwrap(), None);
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn error_message_counts_as_error_status() {
        let (_mock, _session, waiter) = waiter();
        let w1 = WorkspaceId::from("w1");
        let failed = waiter.wait_for(&w1, WorkspaceStatus::Error);
        let failing: WorkspaceStatusEvent = serde_json::from_value(json!({
            "workspaceId": "w1",
            "status": "STARTING",
            "error": "image pull failed",
        }))
        .unwrap();
        waiter.handle(&failing);
        let resolved = failed.await.unwrap().unwrap();
        assert_eq!(resolved.error.as_deref(), Some("image pull failed"));
    }

    #[tokio::test]
    async fn other_workspaces_do_not_resolve() {
        let (_mock, _session, waiter) = waiter();
        let _pending = waiter.wait_for(&WorkspaceId::from("w1"), WorkspaceStatus::Running);
        waiter.handle(&event("w2", "RUNNING"));
        assert_eq!(waiter.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_workspace_resolves_from_channel() {
        let (mock, session, waiter) = waiter();
        let connect = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        settle().await;
        mock.open();
        settle().await;
        let _ = mock.respond_to(CLIENT_ID_METHOD, json!(["c1"]));
        connect.await.unwrap().unwrap();

        let w1 = WorkspaceId::from("w1");
        let track = {
            let waiter = waiter.clone();
            let w1 = w1.clone();
            tokio::spawn(async move { waiter.track(&w1).await })
        };
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        track.await.unwrap().unwrap();
        assert!(waiter.is_tracked(&w1));

        // Tracking twice sends nothing new.
        waiter.track(&w1).await.unwrap();
        assert_eq!(mock.sent_with_method(SUBSCRIBE_METHOD).len(), 1);

        let running = waiter.wait_for(&w1, WorkspaceStatus::Running);
        let _ = mock.notify(
            "workspace/statusChanged",
            json!({"workspaceId": "w1", "status": "RUNNING", "prevStatus": "STARTING"}),
        );
        let ev = running.await.unwrap().unwrap();
        assert_eq!(ev.prev_status, Some(WorkspaceStatus::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn untrack_abandons_waiters() {
        let (_mock, _session, waiter) = waiter();
        let w1 = WorkspaceId::from("w1");
        let pending = waiter.wait_for(&w1, WorkspaceStatus::Running);
        waiter.untrack(&w1).await.unwrap();
        assert!(pending.await.is_err());
        assert_eq!(waiter.pending(), 0);
    }
}
