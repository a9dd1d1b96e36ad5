//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (ledger, event bus, engine, relay)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and query parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
