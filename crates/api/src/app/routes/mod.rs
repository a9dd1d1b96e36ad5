use axum::Router;

pub mod inventory;
pub mod system;

/// Router for the versioned inventory API.
pub fn router() -> Router {
    Router::new().nest("/inventory/v1", inventory::router())
}
