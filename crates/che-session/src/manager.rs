//! Resilient session over one entrypoint.
//!
//! Every state transition runs on a single driver task fed by an unbounded
//! channel: transport events, timer expiries, client-id results, liveness
//! verdicts and explicit commands are serialized there. Work that waits
//! (connecting, fetching the client id, probing, sleeping before a
//! reconnect) runs on helper tasks that report back with an input tagged by
//! the connection generation, so verdicts about an abandoned connection are
//! discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use che_core::constants::{SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};
use che_core::ids::{ClientId, OrganizationId, UserId, WorkspaceId};
use che_rpc::{EventKind, HandlerId, NotificationHandler, PubSubRouter, Transport, TransportEvent};
use che_settings::SessionSettings;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channels::Channel;
use crate::error::SessionError;
use crate::events::{
    InstallerLogEvent, MachineStatusEvent, MembershipEvent, OrganizationEvent, RuntimeLogEvent,
    WorkspaceStatusEvent,
};
use crate::liveness::{LivenessResult, ProbeError, fetch_client_id, run_liveness};
use crate::url::{TokenProvider, connection_url};

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Disconnected,
    /// Socket handshake or client-id fetch in progress.
    Connecting,
    /// Open, identified and probed for liveness.
    Connected,
    /// Waiting out the delay before the next attempt.
    Reconnecting,
    /// Gave up. Only an explicit `connect` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one subscriber of a `(channel, scope)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    channel: Channel,
    scope: String,
    id: HandlerId,
}

impl Subscription {
    /// Subscribed channel.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Scope value (workspace, organization or user id).
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Id of the notification handler.
    pub fn handler_id(&self) -> HandlerId {
        self.id
    }
}

type ScopeKey = (Channel, String);

// ─────────────────────────────────────────────────────────────────────────────
// Session manager
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps one logical connection to an entrypoint alive.
///
/// Cloning yields another handle to the same session. The last handle to go
/// away stops every background task and closes the socket.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    entrypoint: String,
    settings: SessionSettings,
    router: Arc<PubSubRouter>,
    tokens: Option<Arc<dyn TokenProvider>>,
    inputs: mpsc::UnboundedSender<Input>,
    driver_inputs: Mutex<Option<mpsc::UnboundedReceiver<Input>>>,
    state: watch::Sender<ConnectionState>,
    client_id: RwLock<Option<ClientId>>,
    subscriptions: Mutex<HashMap<ScopeKey, Vec<HandlerId>>>,
    listeners: Vec<(EventKind, HandlerId)>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let _ = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(entrypoint = %self.entrypoint, from = %current, to = %next, "state change");
            *current = next;
            true
        });
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
        let transport = self.router.client().transport();
        for (kind, id) in self.listeners.drain(..) {
            let _ = transport.remove_listener(kind, id);
        }
        transport.disconnect();
    }
}

impl SessionManager {
    /// Session for `entrypoint` over `transport`. Nothing happens until
    /// [`Self::connect`].
    pub fn new(
        entrypoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        let (inputs, driver_inputs) = mpsc::unbounded_channel();

        let on_open = {
            let inputs = inputs.clone();
            Arc::new(move |_: &TransportEvent| {
                let _ = inputs.send(Input::Opened);
            })
        };
        let on_close = {
            let inputs = inputs.clone();
            Arc::new(move |_: &TransportEvent| {
                let _ = inputs.send(Input::Closed);
            })
        };
        // The router's client registers first, so pending requests are failed
        // before the driver hears about the close.
        let router = Arc::new(PubSubRouter::new(Arc::clone(&transport)));
        let listeners = vec![
            (EventKind::Open, transport.add_listener(EventKind::Open, on_open)),
            (EventKind::Close, transport.add_listener(EventKind::Close, on_close)),
        ];

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                entrypoint: entrypoint.into(),
                settings,
                router,
                tokens,
                inputs,
                driver_inputs: Mutex::new(Some(driver_inputs)),
                state,
                client_id: RwLock::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                listeners,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The entrypoint this session connects to.
    pub fn entrypoint(&self) -> &str {
        &self.shared.entrypoint
    }

    /// Pub/sub facade over the session's protocol client.
    pub fn router(&self) -> &PubSubRouter {
        &self.shared.router
    }

    /// Server-assigned client id, once known.
    pub fn client_id(&self) -> Option<ClientId> {
        self.shared.client_id.read().clone()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the session is in `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut changes = self.state_changes();
        let _ = changes
            .wait_for(|state| *state == target)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(())
    }

    /// Connect and wait until the session is `Connected`.
    ///
    /// Drops along the way are retried according to the session settings.
    /// Also revives a `Failed` session.
    #[instrument(skip(self), fields(entrypoint = %self.shared.entrypoint))]
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut changes = self.state_changes();
        if *changes.borrow_and_update() == ConnectionState::Connected {
            return Ok(());
        }
        self.ensure_driver();
        self.shared
            .inputs
            .send(Input::Connect)
            .map_err(|_| SessionError::Closed)?;

        loop {
            changes.changed().await.map_err(|_| SessionError::Closed)?;
            let state = *changes.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(SessionError::ReconnectExhausted {
                        attempts: self.shared.settings.max_reconnect_attempts,
                    });
                }
                ConnectionState::Disconnected => return Err(SessionError::Closed),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
        }
    }

    /// Tear the session down: cancel timers, close the socket, forget the
    /// client id and every subscription. The session can be connected again.
    #[instrument(skip(self), fields(entrypoint = %self.shared.entrypoint))]
    pub async fn close(&self) {
        self.ensure_driver();
        let (done, closed) = oneshot::channel();
        if self.shared.inputs.send(Input::Close { done }).is_ok() {
            let _ = closed.await;
        }
    }

    fn ensure_driver(&self) {
        let Some(inputs) = self.shared.driver_inputs.lock().take() else {
            return;
        };
        let driver = Driver {
            shared: Arc::downgrade(&self.shared),
            inputs: self.shared.inputs.clone(),
            cancel: self.shared.cancel.clone(),
            generation: 0,
            attempts: 0,
            next_timer: 0,
            attempt: None,
            reconnect: None,
            liveness: None,
            replay_pending: false,
        };
        let _ = tokio::spawn(driver.run(inputs));
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register `handler` for `channel` scoped to `scope`.
    ///
    /// The server-side `subscribe` request is sent only for the first local
    /// subscriber of the pair.
    #[instrument(skip(self, handler), fields(entrypoint = %self.shared.entrypoint))]
    pub async fn subscribe(
        &self,
        channel: Channel,
        scope: &str,
        handler: NotificationHandler,
    ) -> Result<Subscription, SessionError> {
        let key = (channel, scope.to_owned());
        let first = !self.shared.subscriptions.lock().contains_key(&key);
        let id = if first {
            self.shared
                .router
                .subscribe(
                    SUBSCRIBE_METHOD,
                    channel.method(),
                    handler,
                    Some(channel.scope_params(scope)),
                )
                .await?
        } else {
            self.shared
                .router
                .client()
                .add_notification_handler(channel.method(), handler)
        };
        self.shared.subscriptions.lock().entry(key).or_default().push(id);
        Ok(Subscription {
            channel,
            scope: scope.to_owned(),
            id,
        })
    }

    /// Remove one subscriber. The server-side `unsubscribe` request goes out
    /// when the last subscriber of the pair leaves while connected.
    #[instrument(skip(self), fields(entrypoint = %self.shared.entrypoint))]
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), SessionError> {
        let Subscription { channel, scope, id } = subscription;
        let key = (channel, scope);
        let last = {
            let mut table = self.shared.subscriptions.lock();
            let Some(ids) = table.get_mut(&key) else {
                debug!(%id, "unknown subscription");
                return Ok(());
            };
            let before = ids.len();
            ids.retain(|h| *h != id);
            if ids.len() == before {
                debug!(%id, "unknown subscription");
                return Ok(());
            }
            if ids.is_empty() {
                let _ = table.remove(&key);
                true
            } else {
                false
            }
        };
        let (channel, scope) = key;

        if last && self.state() == ConnectionState::Connected {
            self.shared
                .router
                .unsubscribe(
                    UNSUBSCRIBE_METHOD,
                    channel.method(),
                    id,
                    Some(channel.scope_params(&scope)),
                )
                .await?;
        } else {
            let _ = self
                .shared
                .router
                .client()
                .remove_notification_handler(channel.method(), id);
        }
        Ok(())
    }

    /// Local subscribers of `(channel, scope)`.
    pub fn subscriber_count(&self, channel: Channel, scope: &str) -> usize {
        self.shared
            .subscriptions
            .lock()
            .get(&(channel, scope.to_owned()))
            .map_or(0, Vec::len)
    }

    /// Subscribe with typed payloads. Events that fail to decode or that
    /// `filter` rejects never reach `callback`.
    pub async fn subscribe_channel<E, P, F>(
        &self,
        channel: Channel,
        scope: &str,
        filter: P,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        E: DeserializeOwned + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params: &Value| match E::deserialize(params) {
            Ok(event) => {
                if filter(&event) {
                    callback(&event);
                }
            }
            Err(e) => debug!(%channel, error = %e, "dropping undecodable event"),
        });
        self.subscribe(channel, scope, handler).await
    }

    /// `runtime/log` for a workspace, optionally narrowed to one machine.
    pub async fn subscribe_environment_output<F>(
        &self,
        workspace_id: &WorkspaceId,
        machine_name: Option<&str>,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(&RuntimeLogEvent) + Send + Sync + 'static,
    {
        let workspace = workspace_id.clone();
        let machine = machine_name.map(str::to_owned);
        self.subscribe_channel(
            Channel::RuntimeLog,
            workspace_id,
            move |event: &RuntimeLogEvent| {
                event.workspace().is_none_or(|w| *w == workspace)
                    && machine
                        .as_deref()
                        .is_none_or(|m| event.machine_name.as_deref() == Some(m))
            },
            callback,
        )
        .await
    }

    /// `machine/statusChanged` for a workspace.
    pub async fn subscribe_environment_status<F>(
        &self,
        workspace_id: &WorkspaceId,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(&MachineStatusEvent) + Send + Sync + 'static,
    {
        let workspace = workspace_id.clone();
        self.subscribe_channel(
            Channel::MachineStatus,
            workspace_id,
            move |event: &MachineStatusEvent| event.workspace().is_none_or(|w| *w == workspace),
            callback,
        )
        .await
    }

    /// `installer/log` for a workspace.
    pub async fn subscribe_ws_agent_output<F>(
        &self,
        workspace_id: &WorkspaceId,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(&InstallerLogEvent) + Send + Sync + 'static,
    {
        let workspace = workspace_id.clone();
        self.subscribe_channel(
            Channel::InstallerLog,
            workspace_id,
            move |event: &InstallerLogEvent| event.workspace().is_none_or(|w| *w == workspace),
            callback,
        )
        .await
    }

    /// `workspace/statusChanged` for a workspace. Events for any other
    /// workspace are dropped.
    pub async fn subscribe_workspace_status<F>(
        &self,
        workspace_id: &WorkspaceId,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(&WorkspaceStatusEvent) + Send + Sync + 'static,
    {
        let workspace = workspace_id.clone();
        self.subscribe_channel(
            Channel::WorkspaceStatus,
            workspace_id,
            move |event: &WorkspaceStatusEvent| event.workspace_id == workspace,
            callback,
        )
        .await
    }

    /// `organization/statusChanged` for an organization.
    pub async fn subscribe_organization_status<F>(
        &self,
        organization_id: &OrganizationId,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(&OrganizationEvent) + Send + Sync + 'static,
    {
        let organization = organization_id.clone();
        self.subscribe_channel(
            Channel::OrganizationStatus,
            organization_id,
            move |event: &OrganizationEvent| {
                event.organization.as_ref().is_none_or(|o| o.id == organization)
            },
            callback,
        )
        .await
    }

    /// `organization/membershipChanged` for a user.
    pub async fn subscribe_organization_membership_status<F>(
        &self,
        user_id: &UserId,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(&MembershipEvent) + Send + Sync + 'static,
    {
        self.subscribe_channel(
            Channel::OrganizationMembership,
            user_id,
            |_: &MembershipEvent| true,
            callback,
        )
        .await
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("entrypoint", &self.shared.entrypoint)
            .field("state", &self.shared.state())
            .field("client_id", &*self.shared.client_id.read())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

enum Input {
    Connect,
    Close { done: oneshot::Sender<()> },
    Opened,
    Closed,
    ClientId { generation: u64, result: Result<ClientId, ProbeError> },
    LivenessFailed { generation: u64, reason: String },
    ReconnectDue { timer: u64 },
}

struct Driver {
    shared: Weak<Shared>,
    inputs: mpsc::UnboundedSender<Input>,
    cancel: CancellationToken,
    /// Bumped on every connect attempt and on close.
    generation: u64,
    /// Consecutive failed cycles since the last open.
    attempts: u32,
    next_timer: u64,
    attempt: Option<CancellationToken>,
    reconnect: Option<(u64, CancellationToken)>,
    liveness: Option<CancellationToken>,
    replay_pending: bool,
}

impl Driver {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        loop {
            let input = tokio::select! {
                () = self.cancel.cancelled() => break,
                input = inputs.recv() => input,
            };
            let (Some(input), Some(shared)) = (input, self.shared.upgrade()) else {
                break;
            };
            self.handle(&shared, input);
        }
        self.stop_tasks();
    }

    fn handle(&mut self, shared: &Shared, input: Input) {
        let state = shared.state();
        match input {
            Input::Connect => match state {
                ConnectionState::Disconnected => self.begin_connect(shared),
                ConnectionState::Failed => {
                    self.attempts = 0;
                    self.replay_pending = shared.settings.replay_subscriptions
                        && !shared.subscriptions.lock().is_empty();
                    self.begin_connect(shared);
                }
                _ => debug!(%state, "connect ignored"),
            },
            Input::Close { done } => {
                self.close(shared);
                let _ = done.send(());
            }
            Input::Opened => {
                if state != ConnectionState::Connecting {
                    debug!(%state, "open ignored");
                    return;
                }
                self.attempts = 0;
                self.cancel_reconnect();
                self.fetch_client_id(shared);
            }
            Input::Closed => match state {
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    debug!(%state, "close ignored");
                }
                _ => {
                    warn!(entrypoint = %shared.entrypoint, "connection closed");
                    self.reconnect_cycle(shared);
                }
            },
            Input::ClientId { generation, result } => {
                if generation != self.generation || state != ConnectionState::Connecting {
                    debug!(generation, current = self.generation, "stale client id result");
                    return;
                }
                match result {
                    Ok(id) => {
                        info!(entrypoint = %shared.entrypoint, client_id = %id, "connected");
                        *shared.client_id.write() = Some(id);
                        shared.set_state(ConnectionState::Connected);
                        self.start_liveness(shared);
                        if std::mem::take(&mut self.replay_pending) {
                            replay_subscriptions(shared);
                        }
                    }
                    Err(e) => {
                        warn!(entrypoint = %shared.entrypoint, error = %e, "client id fetch failed");
                        self.reconnect_cycle(shared);
                    }
                }
            }
            Input::LivenessFailed { generation, reason } => {
                if generation != self.generation || state != ConnectionState::Connected {
                    debug!(generation, "stale liveness verdict");
                    return;
                }
                warn!(entrypoint = %shared.entrypoint, %reason, "liveness check failed");
                self.reconnect_cycle(shared);
            }
            Input::ReconnectDue { timer } => {
                if self.reconnect.as_ref().is_some_and(|(id, _)| *id == timer) {
                    self.reconnect = None;
                    self.begin_connect(shared);
                }
            }
        }
    }

    fn begin_connect(&mut self, shared: &Shared) {
        self.generation += 1;
        if let Some(previous) = self.attempt.take() {
            previous.cancel();
        }
        shared.set_state(ConnectionState::Connecting);

        let cancel = self.cancel.child_token();
        self.attempt = Some(cancel.clone());
        let router = Arc::clone(&shared.router);
        let tokens = shared.tokens.clone();
        let entrypoint = shared.entrypoint.clone();
        let client_id = shared.client_id.read().clone();
        let _ = tokio::spawn(async move {
            let connect = async {
                let token = match &tokens {
                    Some(provider) => provider.token().await,
                    None => None,
                };
                let url = connection_url(&entrypoint, client_id.as_ref(), token.as_deref());
                if let Err(e) = router.connect(&url).await {
                    debug!(%entrypoint, error = %e, "connect attempt failed");
                }
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                () = connect => {}
            }
        });
    }

    fn fetch_client_id(&self, shared: &Shared) {
        let router = Arc::clone(&shared.router);
        let timeout = shared.settings.liveness_timeout();
        let inputs = self.inputs.clone();
        let cancel = self.cancel.clone();
        let generation = self.generation;
        let _ = tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = fetch_client_id(router.client(), timeout) => result,
            };
            let _ = inputs.send(Input::ClientId { generation, result });
        });
    }

    fn start_liveness(&mut self, shared: &Shared) {
        self.stop_liveness();
        let cancel = self.cancel.child_token();
        self.liveness = Some(cancel.clone());

        let router = Arc::clone(&shared.router);
        let interval = shared.settings.liveness_interval();
        let timeout = shared.settings.liveness_timeout();
        let inputs = self.inputs.clone();
        let generation = self.generation;
        let _ = tokio::spawn(async move {
            let outcome = run_liveness(interval, cancel, || {
                let router = Arc::clone(&router);
                async move { fetch_client_id(router.client(), timeout).await.map(|_| ()) }
            })
            .await;
            if let LivenessResult::Dead { reason } = outcome {
                let _ = inputs.send(Input::LivenessFailed { generation, reason });
            }
        });
    }

    fn reconnect_cycle(&mut self, shared: &Shared) {
        if self.reconnect.is_some() {
            debug!("reconnect already scheduled");
            return;
        }
        self.stop_liveness();
        self.attempts += 1;

        let max = shared.settings.max_reconnect_attempts;
        if self.attempts >= max {
            if let Some(attempt) = self.attempt.take() {
                attempt.cancel();
            }
            shared.set_state(ConnectionState::Failed);
            warn!(
                entrypoint = %shared.entrypoint,
                attempts = self.attempts,
                "giving up after max reconnect attempts"
            );
            return;
        }

        let delay = shared.settings.reconnect_delay(self.attempts);
        shared.set_state(ConnectionState::Reconnecting);
        warn!(
            entrypoint = %shared.entrypoint,
            attempt = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        self.next_timer += 1;
        let timer = self.next_timer;
        let cancel = self.cancel.child_token();
        self.reconnect = Some((timer, cancel.clone()));
        let inputs = self.inputs.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = inputs.send(Input::ReconnectDue { timer });
                }
            }
        });
    }

    fn close(&mut self, shared: &Shared) {
        self.stop_tasks();
        self.generation += 1;
        self.attempts = 0;
        self.replay_pending = false;

        shared.router.disconnect();
        *shared.client_id.write() = None;
        shared.subscriptions.lock().clear();
        shared.router.client().clear_notification_handlers();
        shared.set_state(ConnectionState::Disconnected);
        info!(entrypoint = %shared.entrypoint, "session closed");
    }

    fn cancel_reconnect(&mut self) {
        if let Some((_, cancel)) = self.reconnect.take() {
            cancel.cancel();
        }
    }

    fn stop_liveness(&mut self) {
        if let Some(cancel) = self.liveness.take() {
            cancel.cancel();
        }
    }

    fn stop_tasks(&mut self) {
        self.cancel_reconnect();
        self.stop_liveness();
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel();
        }
    }
}

/// Re-send `subscribe` for every active scope.
fn replay_subscriptions(shared: &Shared) {
    let scopes: Vec<ScopeKey> = shared.subscriptions.lock().keys().cloned().collect();
    info!(entrypoint = %shared.entrypoint, count = scopes.len(), "replaying subscriptions");
    let router = Arc::clone(&shared.router);
    let _ = tokio::spawn(async move {
        for (channel, scope) in scopes {
            if let Err(e) = router
                .request(SUBSCRIBE_METHOD, Some(channel.scope_params(&scope)))
                .await
            {
                warn!(%channel, %scope, error = %e, "subscription replay failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use che_core::constants::CLIENT_ID_METHOD;
    use che_core::logging::capture_logs;
    use che_rpc::ClientError;
    use che_rpc::transport::mock::MockTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    const ENTRYPOINT: &str = "wss://example/api";

    fn setup() -> (MockTransport, SessionManager) {
        setup_with(SessionSettings::default())
    }

    fn setup_with(settings: SessionSettings) -> (MockTransport, SessionManager) {
        let mock = MockTransport::new();
        let session = SessionManager::new(ENTRYPOINT, Arc::new(mock.clone()), settings, None);
        (mock, session)
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn spawn_connect(session: &SessionManager) -> JoinHandle<Result<(), SessionError>> {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    }

    /// Drive a fresh session to `Connected` with client id `id`.
    async fn connected(mock: &MockTransport, session: &SessionManager, id: &str) {
        let task = spawn_connect(session);
        settle().await;
        mock.open();
        settle().await;
        let _ = mock.respond_to(CLIENT_ID_METHOD, json!([id])).unwrap();
        task.await.unwrap().unwrap();
    }

    fn subscriber(log: &Arc<Mutex<Vec<Value>>>) -> NotificationHandler {
        let log = Arc::clone(log);
        Arc::new(move |params: &Value| log.lock().push(params.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fetches_client_id() {
        let (mock, session) = setup();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        connected(&mock, &session, "client-42").await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.client_id().unwrap().as_str(), "client-42");
        assert_eq!(mock.connects(), vec![ENTRYPOINT]);

        // Already connected: nothing new happens.
        session.connect().await.unwrap();
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_url_carries_client_id() {
        let (mock, session) = setup();
        connected(&mock, &session, "client-42").await;

        mock.close();
        settle().await;
        assert_eq!(
            mock.connects(),
            vec![ENTRYPOINT, "wss://example/api?clientId=client-42"]
        );
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn first_reconnect_immediate_then_delayed() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;

        mock.close();
        settle().await;
        assert_eq!(mock.connect_count(), 2);

        mock.close();
        settle().await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        sleep(Duration::from_secs(29)).await;
        assert_eq!(mock.connect_count(), 2);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.connect_count(), 3);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn open_resets_attempt_counter() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;

        mock.close();
        settle().await;
        mock.open();
        settle().await;
        let _ = mock.respond_to(CLIENT_ID_METHOD, json!(["c1"]));
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connected);

        // Counter back at zero: the next drop reconnects immediately again.
        mock.close();
        settle().await;
        assert_eq!(mock.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (mock, session) = setup();
        let (logs, _guard) = capture_logs();
        let task = spawn_connect(&session);
        settle().await;

        for _ in 0..100 {
            mock.close();
            settle().await;
            sleep(Duration::from_secs(31)).await;
        }

        assert_eq!(session.state(), ConnectionState::Failed);
        assert_eq!(mock.connect_count(), 100);
        assert_matches!(
            task.await.unwrap(),
            Err(SessionError::ReconnectExhausted { attempts: 100 })
        );
        assert!(logs.has_message("giving up after max reconnect attempts"));

        // Terminal: further closes schedule nothing.
        mock.close();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.connect_count(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_revives_on_connect() {
        let settings = SessionSettings {
            max_reconnect_attempts: 1,
            ..SessionSettings::default()
        };
        let (mock, session) = setup_with(settings);
        let task = spawn_connect(&session);
        settle().await;
        mock.close();
        settle().await;
        assert_matches!(task.await.unwrap(), Err(SessionError::ReconnectExhausted { .. }));

        connected(&mock, &session, "c2").await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_probes_while_connected() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        mock.clear_sent();

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(mock.sent_with_method(CLIENT_ID_METHOD).len(), 1);
        let _ = mock.respond_to(CLIENT_ID_METHOD, json!(["c1"]));

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(mock.sent_with_method(CLIENT_ID_METHOD).len(), 2);
        let _ = mock.respond_to(CLIENT_ID_METHOD, json!(["c1"]));
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_client_id_does_not_cancel_reconnect() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        mock.clear_sent();

        // Probe at 10 s, unanswered until after the 5 s timeout.
        sleep(Duration::from_secs(10)).await;
        settle().await;
        let probe = mock.last_request_id(CLIENT_ID_METHOD).unwrap();
        sleep(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(mock.connect_count(), 2);

        mock.respond(&probe, json!(["c1"]));
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.router().client().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_id_failure_triggers_reconnect() {
        let (mock, session) = setup();
        let _task = spawn_connect(&session);
        settle().await;
        mock.open();
        settle().await;
        let id = mock.last_request_id(CLIENT_ID_METHOD).unwrap();
        mock.respond_error(&id, 500, "no id for you");
        settle().await;

        assert_eq!(mock.connect_count(), 2);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn close_resets_everything() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let session = session.clone();
            let handler = subscriber(&log);
            tokio::spawn(async move { session.subscribe(Channel::WorkspaceStatus, "w1", handler).await })
        };
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        let _ = sub.await.unwrap().unwrap();

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.client_id().is_none());
        assert_eq!(session.subscriber_count(Channel::WorkspaceStatus, "w1"), 0);
        assert_eq!(
            session
                .router()
                .client()
                .notification_handler_count("workspace/statusChanged"),
            0
        );
        assert_eq!(mock.disconnect_count(), 1);

        // Neither the liveness timer nor a late close revive it.
        mock.close();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.connect_count(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_connecting_fails_connect() {
        let (_mock, session) = setup();
        let task = spawn_connect(&session);
        settle().await;
        session.close().await;
        assert_matches!(task.await.unwrap(), Err(SessionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn scoped_unsubscribe_is_reference_counted() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        mock.clear_sent();

        let a_log = Arc::new(Mutex::new(Vec::new()));
        let b_log = Arc::new(Mutex::new(Vec::new()));
        let other_log = Arc::new(Mutex::new(Vec::new()));

        let subscribe = |scope: &'static str, log: &Arc<Mutex<Vec<Value>>>| {
            let session = session.clone();
            let handler = subscriber(log);
            tokio::spawn(async move { session.subscribe(Channel::RuntimeLog, scope, handler).await })
        };

        let a = subscribe("w1", &a_log);
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        let a = a.await.unwrap().unwrap();

        // Second subscriber of the same scope sends nothing.
        let b = subscribe("w1", &b_log).await.unwrap().unwrap();
        assert_eq!(mock.sent_with_method(SUBSCRIBE_METHOD).len(), 1);
        assert_eq!(session.subscriber_count(Channel::RuntimeLog, "w1"), 2);

        let other = subscribe("w2", &other_log);
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        let _other = other.await.unwrap().unwrap();
        assert_eq!(mock.sent_with_method(SUBSCRIBE_METHOD).len(), 2);

        session.unsubscribe(a).await.unwrap();
        assert!(mock.sent_with_method(UNSUBSCRIBE_METHOD).is_empty());
        let _ = mock.notify("runtime/log", json!({"text": "x"}));
        assert!(a_log.lock().is_empty());
        assert_eq!(b_log.lock().len(), 1);

        let last = {
            let session = session.clone();
            tokio::spawn(async move { session.unsubscribe(b).await })
        };
        settle().await;
        let sent = mock.sent_with_method(UNSUBSCRIBE_METHOD);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0]["params"],
            json!({"method": "runtime/log", "scope": {"workspaceId": "w1"}})
        );
        let _ = mock.respond_to(UNSUBSCRIBE_METHOD, Value::Null);
        last.await.unwrap().unwrap();

        assert_eq!(session.subscriber_count(Channel::RuntimeLog, "w1"), 0);
        assert_eq!(session.subscriber_count(Channel::RuntimeLog, "w2"), 1);
        let _ = mock.notify("runtime/log", json!({"text": "y"}));
        assert_eq!(other_log.lock().len(), 2);
        assert_eq!(b_log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn workspace_status_filtered_by_workspace() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let session = session.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                session
                    .subscribe_workspace_status(&WorkspaceId::from("w1"), move |e| {
                        seen.lock().push(e.status);
                    })
                    .await
            })
        };
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        let _sub = task.await.unwrap().unwrap();

        let _ = mock.notify(
            "workspace/statusChanged",
            json!({"workspaceId": "w2", "status": "RUNNING"}),
        );
        let _ = mock.notify("workspace/statusChanged", json!({"status": "RUNNING"}));
        let _ = mock.notify(
            "workspace/statusChanged",
            json!({"workspaceId": "w1", "status": "STOPPED"}),
        );
        assert_eq!(*seen.lock(), vec![Some(crate::events::WorkspaceStatus::Stopped)]);
    }

    #[tokio::test(start_paused = true)]
    async fn environment_output_filtered_by_machine() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        let lines = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let session = session.clone();
            let lines = Arc::clone(&lines);
            tokio::spawn(async move {
                session
                    .subscribe_environment_output(&WorkspaceId::from("w1"), Some("db"), move |e| {
                        lines.lock().push(e.text.clone());
                    })
                    .await
            })
        };
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        let _sub = task.await.unwrap().unwrap();

        let _ = mock.notify("runtime/log", json!({"machineName": "app", "text": "no"}));
        let _ = mock.notify("runtime/log", json!({"machineName": "db", "text": "yes"}));
        let _ = mock.notify(
            "runtime/log",
            json!({"runtimeId": {"workspaceId": "w9"}, "machineName": "db", "text": "other ws"}),
        );
        assert_eq!(*lines.lock(), vec!["yes".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscribe_leaves_no_trace() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let session = session.clone();
            let handler = subscriber(&log);
            tokio::spawn(async move { session.subscribe(Channel::MachineStatus, "w1", handler).await })
        };
        settle().await;
        let id = mock.last_request_id(SUBSCRIBE_METHOD).unwrap();
        mock.respond_error(&id, 403, "forbidden");

        assert_matches!(task.await.unwrap(), Err(SessionError::Client(_)));
        assert_eq!(session.subscriber_count(Channel::MachineStatus, "w1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_settles_subscribe_in_flight() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let session = session.clone();
            let handler = subscriber(&log);
            tokio::spawn(async move { session.subscribe(Channel::WorkspaceStatus, "w1", handler).await })
        };
        settle().await;
        assert!(mock.last_request_id(SUBSCRIBE_METHOD).is_some());

        session.close().await;
        assert_matches!(
            task.await.unwrap(),
            Err(SessionError::Client(ClientError::ConnectionClosed))
        );
        assert_eq!(session.subscriber_count(Channel::WorkspaceStatus, "w1"), 0);
        assert_eq!(session.router().client().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_reconnect_settles_requests_on_the_old_socket() {
        let (mock, session) = setup();
        connected(&mock, &session, "c1").await;
        let request = {
            let session = session.clone();
            tokio::spawn(async move { session.router().request("workspace/get", None).await })
        };
        settle().await;

        // The 10 s liveness check goes unanswered and times out at 15 s.
        sleep(Duration::from_secs(16)).await;
        assert_eq!(mock.connect_count(), 2);
        assert_matches!(request.await.unwrap(), Err(ClientError::ConnectionClosed));
        assert_eq!(session.router().client().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_replayed_after_revival() {
        let settings = SessionSettings {
            max_reconnect_attempts: 1,
            ..SessionSettings::default()
        };
        let (mock, session) = setup_with(settings);
        connected(&mock, &session, "c1").await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let session = session.clone();
            let handler = subscriber(&log);
            tokio::spawn(async move { session.subscribe(Channel::OrganizationStatus, "o1", handler).await })
        };
        settle().await;
        let _ = mock.respond_to(SUBSCRIBE_METHOD, Value::Null);
        let _sub = task.await.unwrap().unwrap();

        mock.close();
        settle().await;
        assert_eq!(session.state(), ConnectionState::Failed);
        mock.clear_sent();

        connected(&mock, &session, "c1").await;
        settle().await;
        let replayed = mock.sent_with_method(SUBSCRIBE_METHOD);
        assert_eq!(replayed.len(), 1);
        assert_eq!(
            replayed[0]["params"],
            json!({"method": "organization/statusChanged", "scope": {"organizationId": "o1"}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_observable() {
        let (mock, session) = setup();
        let mut changes = session.state_changes();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_state(ConnectionState::Connected).await })
        };
        connected(&mock, &session, "c1").await;
        waiter.await.unwrap().unwrap();
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn token_provider_consulted_on_connect() {
        let mock = MockTransport::new();
        let session = SessionManager::new(
            ENTRYPOINT,
            Arc::new(mock.clone()),
            SessionSettings::default(),
            Some(Arc::new(crate::url::StaticToken("secret".into()))),
        );
        connected(&mock, &session, "c1").await;
        mock.close();
        settle().await;
        assert_eq!(
            mock.connects(),
            vec![
                "wss://example/api?token=secret",
                "wss://example/api?clientId=c1&token=secret",
            ]
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Failed.as_str(), "failed");
    }
}
