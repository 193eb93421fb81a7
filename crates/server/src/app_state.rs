use std::{sync::Arc, time::Duration};

use server_api::{ApiContext, AuthConfig};
use storage::Storage;

use crate::{broadcast::BroadcastEngine, config::Settings, registry::ConnectionRegistry};

pub struct AppState {
    pub api: ApiContext,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcast: BroadcastEngine,
    pub handshake_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub history_page_limit: u32,
}

impl AppState {
    pub fn new(storage: Storage, settings: &Settings) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcast = BroadcastEngine::new(registry.clone(), Arc::new(storage.clone()));
        Arc::new(Self {
            api: ApiContext {
                storage,
                auth: AuthConfig {
                    secret: settings.jwt_secret.clone(),
                    ttl_seconds: settings.token_ttl_seconds,
                },
            },
            registry,
            broadcast,
            handshake_timeout: settings.handshake_timeout(),
            outbound_queue_capacity: settings.outbound_queue_capacity,
            history_page_limit: settings.history_page_limit,
        })
    }
}
