pub mod appresult;
pub mod hub;
pub mod identity;
pub mod res;
pub mod rooms;
pub mod session;
pub mod store;

pub use appresult::{AppError, AppResult};

use axum::{Router, extract::FromRef};
use tower_http::cors::CorsLayer;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

use hub::Hub;
use store::Directory;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub directory: Directory,
    pub hub: Hub,
}

pub fn app(state: AppState) -> Router {
    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::hours(12)));

    Router::new()
        .merge(identity::router())
        .nest("/r", rooms::router())
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
}
