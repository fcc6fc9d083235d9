//! Shared Application State
//!
//! Wires the session client and realtime engine to one session store and the
//! collaborators chosen by the configuration.

use crate::{config::Config, gateway::LoggingGateway};
use avatar_sync_core::{
    DirectoryAvatarSource, HttpTransport, RealtimeEngine, SessionClient, SessionStore,
    SharedStore,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a command needs, created once at startup.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub client: SessionClient,
    pub engine: RealtimeEngine,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store: SharedStore = Arc::new(Mutex::new(SessionStore::new()));
        let endpoint = config.endpoint();
        let gateway = Arc::new(LoggingGateway::new());

        let client = SessionClient::new(
            Arc::new(HttpTransport::new(&endpoint)),
            store.clone(),
            gateway.clone(),
            Arc::new(DirectoryAvatarSource::new(config.avatar_dir.clone())),
        );
        let engine = RealtimeEngine::new(store.clone(), gateway, endpoint)
            .with_broadcast_interval(config.broadcast_interval);

        Self {
            config: Arc::new(config),
            store,
            client,
            engine,
        }
    }

    /// Restores the persisted session from the configured location.
    pub async fn load_cache(&self) {
        self.client.load_cache(&self.config.cache_location()).await;
    }
}
