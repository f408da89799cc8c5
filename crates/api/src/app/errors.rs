use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use notiq_infra::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("queue item not found: {id}"),
        ),
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        QueueError::Store(e) => {
            tracing::error!(error = %e, "queue store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path or query value, answering 400 with `code` when it is malformed.
pub fn parse_param<T>(raw: &str, code: &'static str) -> Result<T, axum::response::Response>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, code, e.to_string()))
}
