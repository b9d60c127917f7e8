use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::services::clock::{Clock, SystemClock};
use crate::services::mongo_store::MongoSessionStore;
use crate::services::session_service::SessionService;
use crate::services::store::{InMemorySessionStore, SessionStore};

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionService>,
    pub store: Arc<dyn SessionStore>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn SessionStore> = match config.store_backend {
            StoreBackend::Mongo => {
                tracing::info!("Connecting to MongoDB...");
                let client = mongodb::Client::with_uri_str(&config.mongo_uri).await?;
                let store = MongoSessionStore::new(client.database(&config.mongo_database));

                tokio::time::timeout(std::time::Duration::from_secs(5), store.ping())
                    .await
                    .map_err(|_| anyhow::anyhow!("MongoDB ping timeout after 5s"))??;
                store.ensure_indexes().await?;

                tracing::info!("MongoDB connection established successfully");
                Arc::new(store)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory session store; state is lost on restart");
                Arc::new(InMemorySessionStore::new())
            }
        };

        Ok(Self::with_store(config, store, Arc::new(SystemClock::new())))
    }

    /// Wires the service over an explicit store and clock.
    pub fn with_store(config: Config, store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            clock,
            config.session_settings(),
        ));
        Self {
            config,
            sessions,
            store,
        }
    }
}

pub mod clock;
pub mod expiry_worker;
pub mod leaderboard;
pub mod lifecycle;
pub mod mongo_store;
pub mod notifier;
pub mod participants;
pub mod scoring;
pub mod session_service;
pub mod store;
