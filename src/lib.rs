//! hookrelay library crate, shared by the binary and integration tests.

use std::sync::Arc;

pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod service;
pub mod slack;
pub mod store;

use jobs::reconcile::ReconcileStore;
use service::token::{TokenService, TokenStore};
use slack::SlackClient;
use store::{memory::MemoryStore, postgres::PgStore};

/// Shared application state passed to handlers.
pub struct AppState {
    pub tokens: TokenService,
    pub slack: SlackClient,
    pub config: config::Config,
}

/// One backend seen through both engine contracts.
#[derive(Clone)]
pub struct Stores {
    pub tokens: Arc<dyn TokenStore>,
    pub reconcile: Arc<dyn ReconcileStore>,
}

impl Stores {
    pub fn from_backend<S>(store: S) -> Self
    where
        S: ReconcileStore + Clone + 'static,
    {
        Self {
            tokens: Arc::new(store.clone()),
            reconcile: Arc::new(store),
        }
    }
}

/// Postgres when `DATABASE_URL` is set (migrations are applied), the
/// in-memory store otherwise.
pub async fn open_stores(database_url: Option<&str>) -> anyhow::Result<Stores> {
    match database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(url).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Stores::from_backend(db))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, tokens are kept in memory and lost on exit");
            Ok(Stores::from_backend(MemoryStore::new()))
        }
    }
}
