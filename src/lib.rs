pub mod appresult;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use error::ChatError;

use rooms::Hub;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(hub: Hub, config: Config) -> Self {
        Self {
            hub: Arc::new(hub),
            config: Arc::new(config),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(state.config.session_minutes)));

    Router::new()
        .route("/health", get(health))
        .merge(rooms::router())
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}
