//! Roost: a small federated ActivityPub server
//!
//! Local users publish Notes and manage follows through a token
//! authenticated client API; federation happens over signed
//! server-to-server HTTP with per-actor and shared inboxes.

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::data::Database;
use crate::error::Result;
use crate::federation::FederationServer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub federation: Arc<FederationServer>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database.path).await?;
        let federation = FederationServer::new(&config, db.clone())?;
        Ok(Self {
            config: Arc::new(config),
            db,
            federation: Arc::new(federation),
        })
    }
}

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::activitypub::routes())
        .merge(api::wellknown::routes())
        .merge(api::client::routes())
        .merge(api::metrics::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
