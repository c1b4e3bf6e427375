//! One session per entrypoint.

use std::sync::Arc;

use che_rpc::{Transport, WsTransport};
use che_settings::{SessionSettings, TransportSettings};
use dashmap::DashMap;
use tracing::debug;

use crate::manager::SessionManager;
use crate::url::TokenProvider;

/// Builds the transport for a new session.
pub trait TransportFactory: Send + Sync {
    /// A fresh, unconnected transport for `entrypoint`.
    fn create(&self, entrypoint: &str) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, entrypoint: &str) -> Arc<dyn Transport> {
        self(entrypoint)
    }
}

/// WebSocket transports with shared settings.
#[derive(Clone, Debug, Default)]
pub struct WsTransportFactory {
    settings: TransportSettings,
}

impl WsTransportFactory {
    /// Factory handing out [`WsTransport`]s configured with `settings`.
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }
}

impl TransportFactory for WsTransportFactory {
    fn create(&self, _entrypoint: &str) -> Arc<dyn Transport> {
        Arc::new(WsTransport::new(self.settings.clone()))
    }
}

/// Map from entrypoint to its [`SessionManager`].
///
/// Every caller asking for the same entrypoint shares one session.
pub struct ConnectionRegistry {
    sessions: DashMap<String, SessionManager>,
    factory: Arc<dyn TransportFactory>,
    settings: SessionSettings,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl ConnectionRegistry {
    /// Registry creating sessions with `settings` over transports from
    /// `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>, settings: SessionSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            settings,
            tokens: None,
        }
    }

    /// Registry of WebSocket sessions.
    pub fn websocket(transport: TransportSettings, settings: SessionSettings) -> Self {
        Self::new(Arc::new(WsTransportFactory::new(transport)), settings)
    }

    /// Attach a token to every connection URL of sessions created from now on.
    #[must_use]
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// The session for `entrypoint`, created on first use.
    pub fn get_or_create(&self, entrypoint: &str) -> SessionManager {
        self.sessions
            .entry(entrypoint.to_owned())
            .or_insert_with(|| {
                debug!(entrypoint, "creating session");
                SessionManager::new(
                    entrypoint,
                    self.factory.create(entrypoint),
                    self.settings.clone(),
                    self.tokens.clone(),
                )
            })
            .clone()
    }

    /// The session for `entrypoint`, if one exists.
    pub fn get(&self, entrypoint: &str) -> Option<SessionManager> {
        self.sessions.get(entrypoint).map(|s| s.clone())
    }

    /// Close and forget the session for `entrypoint`. Returns whether one
    /// existed.
    pub async fn remove(&self, entrypoint: &str) -> bool {
        match self.sessions.remove(entrypoint) {
            Some((_, session)) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close and forget every session.
    pub async fn clear(&self) {
        let entrypoints: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for entrypoint in entrypoints {
            let _ = self.remove(&entrypoint).await;
        }
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session exists.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConnectionState;
    use crate::url::StaticToken;
    use che_rpc::transport::mock::MockTransport;
    use parking_lot::Mutex;

    /// Factory remembering the mocks it handed out.
    fn recording_factory() -> (Arc<Mutex<Vec<(String, MockTransport)>>>, Arc<dyn TransportFactory>) {
        let made = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&made);
        let factory = move |entrypoint: &str| -> Arc<dyn Transport> {
            let mock = MockTransport::new();
            log.lock().push((entrypoint.to_owned(), mock.clone()));
            Arc::new(mock)
        };
        let factory: Arc<dyn TransportFactory> = Arc::new(factory);
        (made, factory)
    }

    #[test]
    fn same_entrypoint_shares_session() {
        let (made, factory) = recording_factory();
        let registry = ConnectionRegistry::new(factory, SessionSettings::default());

        let a = registry.get_or_create("wss://one/api");
        let b = registry.get_or_create("wss://one/api");
        let _c = registry.get_or_create("wss://two/api");

        assert_eq!(registry.len(), 2);
        assert_eq!(made.lock().len(), 2);
        assert_eq!(a.entrypoint(), b.entrypoint());
        assert!(registry.get("wss://three/api").is_none());
        assert!(registry.get("wss://two/api").is_some());
    }

    #[tokio::test]
    async fn remove_closes_session() {
        let (made, factory) = recording_factory();
        let registry = ConnectionRegistry::new(factory, SessionSettings::default());
        let session = registry.get_or_create("wss://one/api");

        assert!(registry.remove("wss://one/api").await);
        assert!(!registry.remove("wss://one/api").await);
        assert!(registry.is_empty());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(made.lock()[0].1.disconnect_count(), 1);

        // A later lookup builds a new session.
        let _again = registry.get_or_create("wss://one/api");
        assert_eq!(made.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_inherit_token_provider() {
        let (made, factory) = recording_factory();
        let registry = ConnectionRegistry::new(factory, SessionSettings::default())
            .with_token_provider(Arc::new(StaticToken("t".into())));
        let session = registry.get_or_create("wss://one/api");
        let _connect = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(made.lock()[0].1.connects(), vec!["wss://one/api?token=t"]);
    }

    #[tokio::test]
    async fn clear_empties_registry() {
        let (_made, factory) = recording_factory();
        let registry = ConnectionRegistry::new(factory, SessionSettings::default());
        let _ = registry.get_or_create("a");
        let _ = registry.get_or_create("b");
        registry.clear().await;
        assert!(registry.is_empty());
    }
}
