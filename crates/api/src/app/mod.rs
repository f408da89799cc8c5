//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection, dispatcher, runner
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: query parameters and JSON bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/queue", routes::router())
        .layer(Extension(services))
}
