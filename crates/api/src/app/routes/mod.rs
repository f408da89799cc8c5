use axum::{
    Router,
    routing::{get, post},
};

pub mod queue;
pub mod system;

/// Router for the `/queue` operator endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(queue::stats))
        .route("/items", get(queue::list_items))
        .route("/items/:id/retry", post(queue::retry_item))
        .route("/notifications/:id/cancel", post(queue::cancel_notification))
}
